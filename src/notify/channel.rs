//! Delivery channels.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::types::{ChannelKind, Notification, Priority};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No channel registered for {0}")]
    Unregistered(ChannelKind),

    #[error("Notification has no recipients")]
    NoRecipients,

    #[error("Webhook returned HTTP {0}")]
    Http(u16),

    #[error("Delivery transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes notifications to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn deliver(&self, n: &Notification) -> Result<(), DeliveryError> {
        if n.priority >= Priority::High {
            warn!(
                notification_id = %n.id,
                kind = %n.kind,
                priority = ?n.priority,
                recipients = ?n.recipients,
                "{}: {}",
                n.title,
                n.message
            );
        } else {
            info!(
                notification_id = %n.id,
                kind = %n.kind,
                recipients = ?n.recipients,
                "{}: {}",
                n.title,
                n.message
            );
        }
        Ok(())
    }
}

/// POSTs the notification as JSON
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn deliver(&self, n: &Notification) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Http(status.as_u16()))
        }
    }
}

/// Per-recipient inbox held in memory for UI collaborators to read.
///
/// Each inbox keeps the newest `capacity` notifications.
#[derive(Debug)]
pub struct InAppChannel {
    inboxes: DashMap<String, VecDeque<Notification>>,
    capacity: usize,
}

impl Default for InAppChannel {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl InAppChannel {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inboxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn inbox(&self, recipient: &str) -> Vec<Notification> {
        self.inboxes
            .get(recipient)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return everything queued for `recipient`
    pub fn drain(&self, recipient: &str) -> Vec<Notification> {
        self.inboxes
            .remove(recipient)
            .map(|(_, n)| Vec::from(n))
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationChannel for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn deliver(&self, n: &Notification) -> Result<(), DeliveryError> {
        if n.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        for recipient in &n.recipients {
            let mut inbox = self.inboxes.entry(recipient.clone()).or_default();
            if inbox.len() >= self.capacity {
                inbox.pop_front();
            }
            inbox.push_back(n.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;

    #[tokio::test]
    async fn test_in_app_inbox() {
        let channel = InAppChannel::new();
        let n = Notification::new(NotificationKind::System, "t", "m")
            .with_recipients(vec!["ops".into(), "alice".into()]);
        channel.deliver(&n).await.unwrap();

        assert_eq!(channel.inbox("ops").len(), 1);
        assert_eq!(channel.drain("alice").len(), 1);
        assert!(channel.inbox("alice").is_empty());
    }

    #[tokio::test]
    async fn test_in_app_inbox_keeps_newest() {
        let channel = InAppChannel::with_capacity(3);
        for i in 0..5 {
            let n = Notification::new(NotificationKind::System, "t", format!("m{i}"))
                .with_recipients(vec!["ops".into()]);
            channel.deliver(&n).await.unwrap();
        }

        let inbox = channel.inbox("ops");
        let messages: Vec<&str> = inbox.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_in_app_needs_recipients() {
        let channel = InAppChannel::new();
        let n = Notification::new(NotificationKind::System, "t", "m");
        assert_eq!(channel.deliver(&n).await, Err(DeliveryError::NoRecipients));
    }

    #[tokio::test]
    async fn test_log_channel_always_succeeds() {
        let n = Notification::new(NotificationKind::StaleTransfer, "Stale", "t1")
            .with_priority(Priority::Critical);
        assert!(LogChannel.deliver(&n).await.is_ok());
    }
}
