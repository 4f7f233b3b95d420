//! Chat log storage for the SQLite backend.

use plotshare_core::{ChatMessage, MessageId, MessageKind, RequestId, UserId};
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::{from_millis, parse_uuid, to_millis, SqliteRepository};
use crate::repository::{timestamp_now, NewChatMessage, RepositoryError};

impl SqliteRepository {
    pub(super) async fn append_message_impl(
        &self,
        new: NewChatMessage,
    ) -> Result<ChatMessage, RepositoryError> {
        self.with_conn("append_message", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::storage("append_message begin", e.to_string()))?;

            let request_id = new.request_id.to_string();
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT MAX(created_at) FROM chat_messages WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("append_message", e.to_string()))?
                .flatten();

            // Never go backwards, even if the wall clock does.
            let now = to_millis(timestamp_now());
            let created_at = previous.map_or(now, |prev| prev.max(now));
            let id = MessageId::new();

            tx.execute(
                "INSERT INTO chat_messages (id, request_id, sender_id, body, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    request_id,
                    new.sender_id.0,
                    new.body,
                    new.kind.as_str(),
                    created_at
                ],
            )
            .map_err(|e| RepositoryError::storage("append_message", e.to_string()))?;
            let seq = tx.last_insert_rowid();

            tx.commit()
                .map_err(|e| RepositoryError::storage("append_message commit", e.to_string()))?;

            Ok(ChatMessage {
                id,
                request_id: new.request_id,
                sender_id: new.sender_id,
                body: new.body,
                kind: new.kind,
                created_at: from_millis(created_at, "message created_at")?,
                seq,
            })
        })
        .await
    }

    pub(super) async fn list_messages_impl(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let request_id = *request_id;
        self.with_conn("list_messages", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, id, sender_id, body, kind, created_at FROM chat_messages
                     WHERE request_id = ?1
                     ORDER BY created_at ASC, seq ASC",
                )
                .map_err(|e| RepositoryError::storage("list_messages", e.to_string()))?;

            let rows = stmt
                .query_map(params![request_id.to_string()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("list_messages", e.to_string()))?;

            let mut messages = Vec::new();
            for row in rows {
                let (seq, id, sender_id, body, kind, created_at) = row
                    .map_err(|e| RepositoryError::storage("list_messages row", e.to_string()))?;

                // A message with an unreadable kind cannot be classified as
                // human or system, so it is left out of the log.
                let Some(kind) = MessageKind::parse(&kind) else {
                    warn!("Skipping message {} with unknown kind '{}'", id, kind);
                    continue;
                };

                messages.push(ChatMessage {
                    id: MessageId(parse_uuid(&id, "message id")?),
                    request_id,
                    sender_id: UserId(sender_id),
                    body,
                    kind,
                    created_at: from_millis(created_at, "message created_at")?,
                    seq,
                });
            }
            Ok(messages)
        })
        .await
    }
}
