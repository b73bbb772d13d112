//! Notification dispatch.
//!
//! Hands a ready-to-send message to every registered delivery channel. Each
//! channel is retried independently under the configured [`RetryPolicy`]
//! and bounded by a per-attempt timeout; the outcome of every channel is
//! returned as a [`DeliveryRecord`] so the caller can persist it.

pub mod pacing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::call_with_timeout;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::store::DeliveryRecord;

pub use pacing::PacingWindow;

/// Message ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subject_id: String,
    pub text: String,
    /// Concern this follow-up belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concern_id: Option<String>,
}

/// Channel acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Channel-specific message id, if the channel has one.
    pub message_ref: Option<String>,
}

/// Delivery channel contract. New channels only need to implement this trait.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Stable channel identifier (e.g. `push`, `email`).
    fn id(&self) -> &str;

    /// Deliver `message` to `subject_id`.
    async fn deliver(&self, subject_id: &str, message: &OutboundMessage) -> Result<DeliveryAck>;
}

/// Per-channel outcomes of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DeliveryRecord>,
}

impl DispatchReport {
    /// At least one channel accepted the message.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.outcomes.iter().any(|o| o.delivered)
    }

    /// Reference from the first channel that returned one.
    #[must_use]
    pub fn message_ref(&self) -> Option<String> {
        self.outcomes
            .iter()
            .filter(|o| o.delivered)
            .find_map(|o| o.detail.clone())
    }
}

/// Fans messages out to delivery channels.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn DeliveryChannel>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            channels: Vec::new(),
            retry,
            timeout,
        }
    }

    /// Register a channel.
    pub fn add_channel(&mut self, channel: Arc<dyn DeliveryChannel>) {
        self.channels.push(channel);
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.add_channel(channel);
        self
    }

    /// Registered channel ids.
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id().to_owned()).collect()
    }

    /// Deliver on every channel. `at` stamps all resulting records.
    pub async fn dispatch(&self, message: &OutboundMessage, at: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.channels.is_empty() {
            warn!(subject_id = %message.subject_id, "no delivery channels registered");
            return report;
        }

        for channel in &self.channels {
            let result = self
                .retry
                .run("delivery", || {
                    call_with_timeout(
                        self.timeout,
                        "delivery",
                        channel.deliver(&message.subject_id, message),
                    )
                })
                .await;

            let record = match result {
                Ok(ack) => {
                    info!(
                        channel = channel.id(),
                        subject_id = %message.subject_id,
                        concern_id = ?message.concern_id,
                        "notification delivered"
                    );
                    DeliveryRecord {
                        subject_id: message.subject_id.clone(),
                        channel_id: channel.id().to_owned(),
                        concern_id: message.concern_id.clone(),
                        delivered: true,
                        detail: ack.message_ref,
                        at,
                    }
                }
                Err(e) => {
                    warn!(
                        channel = channel.id(),
                        subject_id = %message.subject_id,
                        concern_id = ?message.concern_id,
                        "delivery failed: {e}"
                    );
                    DeliveryRecord {
                        subject_id: message.subject_id.clone(),
                        channel_id: channel.id().to_owned(),
                        concern_id: message.concern_id.clone(),
                        delivered: false,
                        detail: Some(e.to_string()),
                        at,
                    }
                }
            };
            report.outcomes.push(record);
        }
        report
    }
}
