//! Chat channels bound to space requests, and the notices lifecycle
//! transitions post into them.

mod channel;
mod notice;

pub use channel::{ChatHub, Subscription, SubscriptionError};
pub use notice::SystemNoticeEmitter;
