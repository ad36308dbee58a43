//! Notification Dispatcher
//!
//! Decouples the reconciliation loop from slow delivery channels.

pub mod channel;
pub mod dispatcher;
pub mod types;

pub use channel::{DeliveryError, InAppChannel, LogChannel, NotificationChannel, WebhookChannel};
pub use dispatcher::{DispatcherStats, NotificationDispatcher};
pub use types::{ChannelKind, DeliveryStatus, Notification, NotificationKind, Priority};
