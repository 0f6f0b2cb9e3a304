use crate::payload::EventType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Success,
    Failed,
}

impl EventStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per vendor event id, kept until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub subscription_id: Option<String>,
    pub signature: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When the current `pending` claim was taken. Rows written before this
    /// field existed load as the epoch, so their claims count as stale.
    #[serde(default)]
    pub claimed_at: DateTime<Utc>,
    pub status: EventStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl ProcessedEvent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A `pending` claim whose holder never finished within `lease`.
    pub fn claim_is_stale(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && now.signed_duration_since(self.claimed_at) >= lease
    }

    /// `success`, or a `pending` claim still inside its lease.
    pub fn blocks_redelivery(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Success => true,
            EventStatus::Pending => !self.claim_is_stale(lease, now),
            EventStatus::Failed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub event_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub ip: String,
    pub status: u16,
    pub outcome: String,
}

/// A verified webhook queued for event.publish, not yet sent to host.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_id: String,
    pub event_type: String,
    pub subject: String,
    pub data: serde_json::Value,
}
