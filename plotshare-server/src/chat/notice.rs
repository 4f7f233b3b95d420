//! Translates entered statuses into system notices.

use std::sync::Arc;

use plotshare_core::{ChatMessage, NoticeKind, SpaceRequest};

use super::ChatHub;
use crate::error::ChatError;

pub struct SystemNoticeEmitter {
    hub: Arc<ChatHub>,
}

impl SystemNoticeEmitter {
    pub fn new(hub: Arc<ChatHub>) -> Self {
        Self { hub }
    }

    /// Post the notice owed for the status `request` has just entered.
    ///
    /// Returns `Ok(None)` for statuses that carry no notice.
    pub async fn emit(&self, request: &SpaceRequest) -> Result<Option<ChatMessage>, ChatError> {
        let Some(kind) = NoticeKind::for_status(request.status) else {
            return Ok(None);
        };
        self.hub.post_notice(&request.id, kind).await.map(Some)
    }
}
