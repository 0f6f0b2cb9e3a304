use crate::error::{GuardError, Result};
use crate::payload::EventType;
use crate::store::EventStore;
use crate::types::{EventStatus, ProcessedEvent};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 900;

/// Delivery metadata captured when an event is first claimed.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    pub subscription_id: Option<String>,
    pub signature: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Replay protection keyed on the vendor event id.
///
/// Only rows younger than the retention window count. Once a row ages out,
/// a redelivery of the same id looks brand new, so the freshness check on
/// the payload timestamp must be much shorter than `retention`.
///
/// A `pending` claim only holds for `claim_lease`. If its holder crashed or
/// could not record the outcome, the next redelivery takes it over.
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn EventStore>,
    retention: Duration,
    claim_lease: Duration,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn EventStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// True when a redelivery of `record` would be skipped.
    pub fn blocks_redelivery(&self, record: &ProcessedEvent) -> bool {
        record.blocks_redelivery(self.claim_lease, Utc::now())
    }

    /// True when a live record is `success`, or `pending` within its lease.
    /// `failed` records and stale claims stay eligible for a vendor retry.
    pub fn is_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .lookup(event_id)?
            .is_some_and(|r| self.blocks_redelivery(&r)))
    }

    pub fn lookup(&self, event_id: &str) -> Result<Option<ProcessedEvent>> {
        self.store.get(event_id, Utc::now())
    }

    /// Claim `event_id` for processing.
    ///
    /// Exactly one of any set of concurrent callers succeeds; the rest get
    /// [`GuardError::DuplicateEvent`]. A live `failed` record or stale claim
    /// is reclaimed instead of inserted.
    pub fn record_event(
        &self,
        event_id: &str,
        event_type: EventType,
        ctx: DeliveryContext,
    ) -> Result<ProcessedEvent> {
        let now = Utc::now();
        let record = ProcessedEvent {
            event_id: event_id.to_string(),
            event_type,
            subscription_id: ctx.subscription_id,
            signature: ctx.signature,
            ip: ctx.ip,
            user_agent: ctx.user_agent,
            processed_at: now,
            expires_at: now
                .checked_add_signed(self.retention)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            claimed_at: now,
            status: EventStatus::Pending,
            error_message: None,
            retry_count: 0,
        };

        match self.store.insert_new(record.clone(), now) {
            Ok(()) => Ok(record),
            Err(GuardError::DuplicateEvent(_)) => {
                match self.store.reclaim(event_id, self.claim_lease, now) {
                    Ok(reclaimed) => {
                        tracing::info!(
                            event_id,
                            retry_count = reclaimed.retry_count,
                            "reclaimed event for retry"
                        );
                        Ok(reclaimed)
                    }
                    // Lost the race, or the row expired in between.
                    Err(GuardError::EventNotFound(_)) => {
                        Err(GuardError::DuplicateEvent(event_id.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn mark_succeeded(&self, event_id: &str) -> Result<ProcessedEvent> {
        self.store
            .update_status(event_id, EventStatus::Success, None, Utc::now())
    }

    /// Set `failed`, bump `retry_count`. Absent or expired rows are left alone.
    pub fn mark_failed(&self, event_id: &str, message: &str) -> Result<ProcessedEvent> {
        self.store.update_status(
            event_id,
            EventStatus::Failed,
            Some(message.to_string()),
            Utc::now(),
        )
    }

    pub fn list(&self, status: Option<EventStatus>, limit: usize) -> Result<Vec<ProcessedEvent>> {
        self.store.list(status, limit, Utc::now())
    }

    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired(Utc::now())?;
        if purged > 0 {
            tracing::info!(purged, "purged expired webhook events");
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("retention", &self.retention)
            .field("claim_lease", &self.claim_lease)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;

    fn guard() -> ReplayGuard {
        ReplayGuard::new(
            Arc::new(MemoryEventStore::new()),
            Duration::days(DEFAULT_RETENTION_DAYS),
        )
    }

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            subscription_id: Some("sub_1".into()),
            signature: "abc".into(),
            ip: Some("52.66.135.170".into()),
            user_agent: Some("Razorpay-Webhook/v1".into()),
        }
    }

    #[test]
    fn unknown_event_is_not_processed() {
        assert!(!guard().is_processed("evt_never").unwrap());
    }

    #[test]
    fn recorded_event_is_processed() {
        let guard = guard();
        let rec = guard
            .record_event("evt_123", EventType::SubscriptionCharged, ctx())
            .unwrap();
        assert_eq!(rec.status, EventStatus::Pending);
        assert_eq!(rec.expires_at - rec.processed_at, Duration::days(30));
        assert!(guard.is_processed("evt_123").unwrap());
    }

    #[test]
    fn second_record_is_duplicate() {
        let guard = guard();
        guard
            .record_event("evt_123", EventType::SubscriptionCharged, ctx())
            .unwrap();
        guard.mark_succeeded("evt_123").unwrap();
        let err = guard
            .record_event("evt_123", EventType::SubscriptionCharged, ctx())
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn failed_event_can_be_retried_once() {
        let guard = guard();
        guard
            .record_event("evt_f", EventType::PaymentFailed, ctx())
            .unwrap();
        let failed = guard.mark_failed("evt_f", "db down").unwrap();
        assert_eq!(failed.retry_count, 1);
        assert!(!guard.is_processed("evt_f").unwrap());

        let retried = guard
            .record_event("evt_f", EventType::PaymentFailed, ctx())
            .unwrap();
        assert_eq!(retried.status, EventStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(guard
            .record_event("evt_f", EventType::PaymentFailed, ctx())
            .unwrap_err()
            .is_duplicate());
    }

    #[test]
    fn mark_failed_does_not_create_rows() {
        let guard = guard();
        assert!(matches!(
            guard.mark_failed("evt_missing", "boom"),
            Err(GuardError::EventNotFound(_))
        ));
        assert!(guard.lookup("evt_missing").unwrap().is_none());
    }

    #[test]
    fn zero_retention_records_expire_immediately() {
        let guard = ReplayGuard::new(Arc::new(MemoryEventStore::new()), Duration::zero());
        guard
            .record_event("evt_z", EventType::SubscriptionPaused, ctx())
            .unwrap();
        assert!(!guard.is_processed("evt_z").unwrap());
        assert!(matches!(
            guard.mark_failed("evt_z", "late"),
            Err(GuardError::EventNotFound(_))
        ));
        assert_eq!(guard.purge_expired().unwrap(), 1);
        assert_eq!(guard.len(), 0);
    }

    #[test]
    fn unbounded_retention_saturates_expiry() {
        let guard = ReplayGuard::new(Arc::new(MemoryEventStore::new()), Duration::MAX);
        let rec = guard
            .record_event("evt_far", EventType::SubscriptionCharged, ctx())
            .unwrap();
        assert_eq!(rec.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(guard.is_processed("evt_far").unwrap());
    }

    #[test]
    fn stranded_claim_is_taken_over_after_lease() {
        let guard = guard();
        guard
            .record_event("evt_crash", EventType::SubscriptionCharged, ctx())
            .unwrap();
        assert!(guard.is_processed("evt_crash").unwrap());
        assert!(guard
            .record_event("evt_crash", EventType::SubscriptionCharged, ctx())
            .unwrap_err()
            .is_duplicate());

        let expired_lease = guard.clone().with_claim_lease(Duration::zero());
        assert!(!expired_lease.is_processed("evt_crash").unwrap());
        let retaken = expired_lease
            .record_event("evt_crash", EventType::SubscriptionCharged, ctx())
            .unwrap();
        assert_eq!(retaken.status, EventStatus::Pending);
        assert_eq!(retaken.retry_count, 0);

        expired_lease.mark_succeeded("evt_crash").unwrap();
        assert!(expired_lease.is_processed("evt_crash").unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let guard = guard();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move {
                guard.record_event("evt_race", EventType::SubscriptionCharged, ctx())
            }));
        }
        let mut ok = 0;
        let mut dup = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) if e.is_duplicate() => dup += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dup, 15);
    }
}
