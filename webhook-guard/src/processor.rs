use crate::payload::ParsedWebhook;
use crate::types::{PendingEvent, ProcessedEvent};
use tokio::sync::mpsc;

/// Business handling for a webhook that passed every integrity check.
///
/// Runs after the event id has been claimed. An `Err` marks the record
/// failed and is reported as a processing failure.
pub trait WebhookProcessor: Send + Sync {
    fn process(&self, webhook: &ParsedWebhook, record: &ProcessedEvent) -> Result<(), String>;
}

pub type EventQueue = mpsc::UnboundedReceiver<PendingEvent>;

/// Hands verified events to the host publish queue.
///
/// Delivery to the host is at most once. The record is marked `success` when
/// the event is queued, so an event dropped before the host acknowledges it
/// (broken pipe, restart before the next drain) is alerted but not redelivered.
#[derive(Clone)]
pub struct ChannelProcessor {
    event_tx: mpsc::UnboundedSender<PendingEvent>,
}

impl ChannelProcessor {
    pub fn channel() -> (Self, EventQueue) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }
}

impl WebhookProcessor for ChannelProcessor {
    fn process(&self, webhook: &ParsedWebhook, _record: &ProcessedEvent) -> Result<(), String> {
        let subject = webhook
            .event
            .subscription_id()
            .or_else(|| webhook.event.payment().map(|p| p.id.as_str()))
            .unwrap_or(webhook.id.as_str());
        let event = PendingEvent {
            event_id: webhook.id.clone(),
            event_type: format!("razorpay.{}", webhook.event_type()),
            subject: subject.to_string(),
            data: webhook.body.clone(),
        };
        self.event_tx
            .send(event)
            .map_err(|_| "host event queue closed".to_string())
    }
}
