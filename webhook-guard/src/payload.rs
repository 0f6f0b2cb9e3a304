//! Typed Razorpay webhook payloads.
//!
//! Deliveries are parsed into an envelope first, then the `payload` object is
//! validated against the schema for the declared event type. Handlers only
//! ever see a [`WebhookEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "subscription.activated")]
    SubscriptionActivated,
    #[serde(rename = "subscription.charged")]
    SubscriptionCharged,
    #[serde(rename = "subscription.cancelled")]
    SubscriptionCancelled,
    #[serde(rename = "subscription.completed")]
    SubscriptionCompleted,
    #[serde(rename = "subscription.paused")]
    SubscriptionPaused,
    #[serde(rename = "subscription.resumed")]
    SubscriptionResumed,
    #[serde(rename = "subscription.pending")]
    SubscriptionPending,
    #[serde(rename = "subscription.halted")]
    SubscriptionHalted,
    #[serde(rename = "payment.captured")]
    PaymentCaptured,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        Self::SubscriptionActivated,
        Self::SubscriptionCharged,
        Self::SubscriptionCancelled,
        Self::SubscriptionCompleted,
        Self::SubscriptionPaused,
        Self::SubscriptionResumed,
        Self::SubscriptionPending,
        Self::SubscriptionHalted,
        Self::PaymentCaptured,
        Self::PaymentFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionActivated => "subscription.activated",
            Self::SubscriptionCharged => "subscription.charged",
            Self::SubscriptionCancelled => "subscription.cancelled",
            Self::SubscriptionCompleted => "subscription.completed",
            Self::SubscriptionPaused => "subscription.paused",
            Self::SubscriptionResumed => "subscription.resumed",
            Self::SubscriptionPending => "subscription.pending",
            Self::SubscriptionHalted => "subscription.halted",
            Self::PaymentCaptured => "payment.captured",
            Self::PaymentFailed => "payment.failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    fn is_subscription(self) -> bool {
        !matches!(self, Self::PaymentCaptured | Self::PaymentFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("malformed {event} payload: {reason}")]
    Schema { event: EventType, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription: Entity<Subscription>,
    #[serde(default)]
    pub payment: Option<Entity<Payment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub payment: Entity<Payment>,
}

/// Validated webhook event, tagged by its event type.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Subscription(EventType, SubscriptionPayload),
    Payment(EventType, PaymentPayload),
}

impl WebhookEvent {
    fn from_parts(event_type: EventType, payload: Value) -> Result<Self, PayloadError> {
        let schema_err = |e: serde_json::Error| PayloadError::Schema {
            event: event_type,
            reason: e.to_string(),
        };
        if event_type.is_subscription() {
            let p = serde_json::from_value(payload).map_err(schema_err)?;
            Ok(Self::Subscription(event_type, p))
        } else {
            let p = serde_json::from_value(payload).map_err(schema_err)?;
            Ok(Self::Payment(event_type, p))
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::Subscription(t, _) | Self::Payment(t, _) => *t,
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Subscription(_, p) => Some(p.subscription.entity.id.as_str()),
            Self::Payment(..) => None,
        }
    }

    pub fn payment(&self) -> Option<&Payment> {
        match self {
            Self::Subscription(_, p) => p.payment.as_ref().map(|e| &e.entity),
            Self::Payment(_, p) => Some(&p.payment.entity),
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: Option<String>,
    event: Option<String>,
    created_at: Option<i64>,
    #[serde(default)]
    payload: Option<Value>,
}

/// A delivery that passed schema validation.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub id: String,
    pub created_at: i64,
    pub event: WebhookEvent,
    /// Parsed body, retained for forwarding to the host.
    pub body: Value,
}

impl ParsedWebhook {
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        let raw: RawEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

        let id = raw
            .id
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField("id"))?;
        let event = raw
            .event
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField("event"))?;
        let created_at = raw.created_at.ok_or(PayloadError::MissingField("created_at"))?;
        let payload = raw.payload.ok_or(PayloadError::MissingField("payload"))?;

        let event_type =
            EventType::parse(&event).ok_or_else(|| PayloadError::UnknownEventType(event))?;
        let event = WebhookEvent::from_parts(event_type, payload)?;

        Ok(Self {
            id,
            created_at,
            event,
            body: value,
        })
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}
