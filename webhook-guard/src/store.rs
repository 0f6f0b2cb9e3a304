use crate::error::{GuardError, Result};
use crate::types::{EventStatus, ProcessedEvent};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const EVENTS_FILE: &str = "processed_events.json";

/// Persistence for processed webhook events.
///
/// Every method that takes `now` treats rows with `expires_at <= now` as
/// absent. `insert_new` and `reclaim` are the uniqueness boundary:
/// for a given event id at most one concurrent caller wins.
pub trait EventStore: Send + Sync {
    fn get(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<ProcessedEvent>>;

    /// Insert a record unless a live one with the same id exists.
    fn insert_new(&self, record: ProcessedEvent, now: DateTime<Utc>) -> Result<()>;

    /// Take over a live `failed` record, or a `pending` one whose claim is
    /// older than `lease`, and restart its claim at `now`.
    fn reclaim(
        &self,
        event_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent>;

    fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent>;

    /// Live records, newest first.
    fn list(
        &self,
        status: Option<EventStatus>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedEvent>>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn len(&self) -> usize;
}

#[derive(Debug, Default, Clone)]
struct EventTable {
    rows: HashMap<String, ProcessedEvent>,
}

impl EventTable {
    fn live(&self, event_id: &str, now: DateTime<Utc>) -> Option<&ProcessedEvent> {
        self.rows.get(event_id).filter(|r| !r.is_expired(now))
    }

    fn insert_new(&mut self, record: ProcessedEvent, now: DateTime<Utc>) -> Result<()> {
        if self.live(&record.event_id, now).is_some() {
            return Err(GuardError::DuplicateEvent(record.event_id));
        }
        // An expired row with the same id is replaced.
        self.rows.insert(record.event_id.clone(), record);
        Ok(())
    }

    fn reclaim(
        &mut self,
        event_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        let current = self
            .live(event_id, now)
            .ok_or_else(|| GuardError::EventNotFound(event_id.to_string()))?;
        if current.blocks_redelivery(lease, now) {
            return Err(GuardError::DuplicateEvent(event_id.to_string()));
        }
        let row = self
            .rows
            .get_mut(event_id)
            .ok_or_else(|| GuardError::EventNotFound(event_id.to_string()))?;
        row.status = EventStatus::Pending;
        row.claimed_at = now;
        Ok(row.clone())
    }

    fn update_status(
        &mut self,
        event_id: &str,
        status: EventStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        let current = self
            .live(event_id, now)
            .map(|r| r.status)
            .ok_or_else(|| GuardError::EventNotFound(event_id.to_string()))?;
        if current == EventStatus::Success && status != EventStatus::Success {
            return Err(GuardError::DuplicateEvent(event_id.to_string()));
        }
        let row = self
            .rows
            .get_mut(event_id)
            .ok_or_else(|| GuardError::EventNotFound(event_id.to_string()))?;
        if status == EventStatus::Failed {
            row.retry_count = row.retry_count.saturating_add(1);
        }
        row.status = status;
        if error_message.is_some() {
            row.error_message = error_message;
        }
        Ok(row.clone())
    }

    fn list(
        &self,
        status: Option<EventStatus>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<ProcessedEvent> {
        let mut items: Vec<&ProcessedEvent> = self
            .rows
            .values()
            .filter(|r| !r.is_expired(now))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        items.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        items.into_iter().take(limit).cloned().collect()
    }

    fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.rows
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.event_id.clone())
            .collect()
    }
}

fn lock(table: &Mutex<EventTable>) -> MutexGuard<'_, EventTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local store. Records vanish on restart.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    table: Mutex<EventTable>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryEventStore {
    fn get(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<ProcessedEvent>> {
        Ok(lock(&self.table).live(event_id, now).cloned())
    }

    fn insert_new(&self, record: ProcessedEvent, now: DateTime<Utc>) -> Result<()> {
        lock(&self.table).insert_new(record, now)
    }

    fn reclaim(
        &self,
        event_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        lock(&self.table).reclaim(event_id, lease, now)
    }

    fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        lock(&self.table).update_status(event_id, status, error_message, now)
    }

    fn list(
        &self,
        status: Option<EventStatus>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedEvent>> {
        Ok(lock(&self.table).list(status, limit, now))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut table = lock(&self.table);
        let ids = table.expired_ids(now);
        for id in &ids {
            table.rows.remove(id);
        }
        Ok(ids.len())
    }

    fn len(&self) -> usize {
        lock(&self.table).rows.len()
    }
}

/// JSON-file store under the extension's data directory.
///
/// The file is rewritten after every mutation while the table lock is held.
/// When the write fails the in-memory change is rolled back and the caller
/// gets [`GuardError::Storage`].
#[derive(Debug)]
pub struct FileEventStore {
    table: Mutex<EventTable>,
    path: PathBuf,
}

impl FileEventStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| GuardError::Storage(format!("failed to create data dir: {e}")))?;
        let path = data_dir.join(EVENTS_FILE);

        let mut table = EventTable::default();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| GuardError::Storage(format!("failed to read {EVENTS_FILE}: {e}")))?;
            let items: Vec<ProcessedEvent> = serde_json::from_str(&content)?;
            for record in items {
                table.rows.insert(record.event_id.clone(), record);
            }
        }
        tracing::debug!(path = %path.display(), records = table.rows.len(), "loaded event store");

        Ok(Self {
            table: Mutex::new(table),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, table: &EventTable) -> Result<()> {
        let mut items: Vec<&ProcessedEvent> = table.rows.values().collect();
        items.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        let content = serde_json::to_string_pretty(&items)?;
        std::fs::write(&self.path, content)
            .map_err(|e| GuardError::Storage(format!("failed to write {EVENTS_FILE}: {e}")))
    }

    /// Run `f` against the table and persist, restoring `keys` on write failure.
    fn commit<T>(
        &self,
        keys: &[String],
        f: impl FnOnce(&mut EventTable) -> Result<T>,
    ) -> Result<T> {
        let mut table = lock(&self.table);
        let saved: Vec<(String, Option<ProcessedEvent>)> = keys
            .iter()
            .map(|k| (k.clone(), table.rows.get(k).cloned()))
            .collect();

        let out = f(&mut table)?;

        if let Err(e) = self.save(&table) {
            for (key, prev) in saved {
                match prev {
                    Some(row) => {
                        table.rows.insert(key, row);
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
            }
            tracing::error!(error = %e, "event store write failed, change rolled back");
            return Err(e);
        }
        Ok(out)
    }
}

impl EventStore for FileEventStore {
    fn get(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<ProcessedEvent>> {
        Ok(lock(&self.table).live(event_id, now).cloned())
    }

    fn insert_new(&self, record: ProcessedEvent, now: DateTime<Utc>) -> Result<()> {
        let keys = [record.event_id.clone()];
        self.commit(&keys, |t| t.insert_new(record, now))
    }

    fn reclaim(
        &self,
        event_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        self.commit(&[event_id.to_string()], |t| t.reclaim(event_id, lease, now))
    }

    fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        self.commit(&[event_id.to_string()], |t| {
            t.update_status(event_id, status, error_message, now)
        })
    }

    fn list(
        &self,
        status: Option<EventStatus>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessedEvent>> {
        Ok(lock(&self.table).list(status, limit, now))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids = lock(&self.table).expired_ids(now);
        if ids.is_empty() {
            return Ok(0);
        }
        self.commit(&ids, |t| {
            // Rows may have been replaced since the ids were collected.
            let mut removed = 0;
            for id in &ids {
                if t.rows.get(id).is_some_and(|r| r.is_expired(now)) {
                    t.rows.remove(id);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn len(&self) -> usize {
        lock(&self.table).rows.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::payload::EventType;
    use std::sync::Arc;

    fn lease() -> Duration {
        Duration::minutes(15)
    }

    pub(crate) fn record(event_id: &str, now: DateTime<Utc>) -> ProcessedEvent {
        ProcessedEvent {
            event_id: event_id.to_string(),
            event_type: EventType::SubscriptionCharged,
            subscription_id: Some("sub_1".into()),
            signature: "sig".into(),
            ip: Some("127.0.0.1".into()),
            user_agent: None,
            processed_at: now,
            expires_at: now + Duration::days(30),
            claimed_at: now,
            status: EventStatus::Pending,
            error_message: None,
            retry_count: 0,
        }
    }

    fn exercise_store(store: &dyn EventStore) {
        let now = Utc::now();
        assert!(store.get("evt_1", now).unwrap().is_none());

        store.insert_new(record("evt_1", now), now).unwrap();
        let err = store.insert_new(record("evt_1", now), now).unwrap_err();
        assert!(err.is_duplicate());

        let failed = store
            .update_status("evt_1", EventStatus::Failed, Some("boom".into()), now)
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        let reclaimed = store.reclaim("evt_1", lease(), now).unwrap();
        assert_eq!(reclaimed.status, EventStatus::Pending);
        assert!(store.reclaim("evt_1", lease(), now).unwrap_err().is_duplicate());

        store
            .update_status("evt_1", EventStatus::Success, None, now)
            .unwrap();
        assert!(store
            .update_status("evt_1", EventStatus::Failed, Some("late".into()), now)
            .unwrap_err()
            .is_duplicate());
        assert_eq!(
            store.get("evt_1", now).unwrap().unwrap().status,
            EventStatus::Success
        );
    }

    #[test]
    fn memory_store_semantics() {
        exercise_store(&MemoryEventStore::new());
    }

    #[test]
    fn file_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FileEventStore::open(dir.path()).unwrap());
    }

    #[test]
    fn expired_rows_are_invisible_and_not_resurrected() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store.insert_new(record("evt_old", now), now).unwrap();

        let later = now + Duration::days(31);
        assert!(store.get("evt_old", later).unwrap().is_none());
        assert!(matches!(
            store.update_status("evt_old", EventStatus::Failed, None, later),
            Err(GuardError::EventNotFound(_))
        ));
        assert!(matches!(
            store.reclaim("evt_old", lease(), later),
            Err(GuardError::EventNotFound(_))
        ));

        // A fresh delivery may reuse the id once the old row aged out.
        store.insert_new(record("evt_old", later), later).unwrap();
        assert!(store.get("evt_old", later).unwrap().is_some());
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store.insert_new(record("evt_a", now), now).unwrap();
        let later = now + Duration::days(20);
        store.insert_new(record("evt_b", later), later).unwrap();

        let purge_at = now + Duration::days(31);
        assert_eq!(store.purge_expired(purge_at).unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("evt_b", purge_at).unwrap().is_some());
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        for i in 0..5 {
            let at = now + Duration::seconds(i);
            store.insert_new(record(&format!("evt_{i}"), at), at).unwrap();
        }
        store
            .update_status("evt_2", EventStatus::Failed, None, now)
            .unwrap();

        let all = store.list(None, 3, now).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, ["evt_4", "evt_3", "evt_2"]);

        let failed = store.list(Some(EventStatus::Failed), 10, now).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_id, "evt_2");
    }

    #[test]
    fn file_store_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = FileEventStore::open(dir.path()).unwrap();
            store.insert_new(record("evt_persist", now), now).unwrap();
            store
                .update_status("evt_persist", EventStatus::Success, None, now)
                .unwrap();
        }
        let reopened = FileEventStore::open(dir.path()).unwrap();
        let row = reopened.get("evt_persist", now).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Success);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn file_store_rolls_back_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::open(dir.path()).unwrap();
        let now = Utc::now();

        // Replace the data file with a directory so writes fail.
        std::fs::create_dir(store.path()).unwrap();

        let err = store.insert_new(record("evt_x", now), now).unwrap_err();
        assert!(matches!(err, GuardError::Storage(_)));
        assert!(store.get("evt_x", now).unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn stale_pending_claim_can_be_taken_over() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store.insert_new(record("evt_stuck", now), now).unwrap();

        let soon = now + Duration::minutes(5);
        assert!(store.reclaim("evt_stuck", lease(), soon).unwrap_err().is_duplicate());

        let later = now + Duration::minutes(16);
        let taken = store.reclaim("evt_stuck", lease(), later).unwrap();
        assert_eq!(taken.status, EventStatus::Pending);
        assert_eq!(taken.claimed_at, later);
        // The new claim holds its own lease.
        assert!(store.reclaim("evt_stuck", lease(), later).unwrap_err().is_duplicate());
    }

    #[test]
    fn legacy_rows_without_claim_time_load_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut row = serde_json::to_value(record("evt_legacy", now)).unwrap();
        row.as_object_mut().unwrap().remove("claimed_at");
        std::fs::write(
            dir.path().join(EVENTS_FILE),
            serde_json::to_string(&vec![row]).unwrap(),
        )
        .unwrap();

        let store = FileEventStore::open(dir.path()).unwrap();
        assert!(store.reclaim("evt_legacy", lease(), now).is_ok());
    }

    fn race_inserts(store: Arc<dyn EventStore>) {
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.insert_new(record("evt_race", now), now))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(GuardError::is_duplicate));
    }

    #[test]
    fn concurrent_inserts_have_one_winner() {
        race_inserts(Arc::new(MemoryEventStore::new()));
    }

    #[test]
    fn concurrent_file_inserts_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileEventStore::open(dir.path()).unwrap());
        race_inserts(store.clone());

        let reopened = FileEventStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn concurrent_file_reclaims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileEventStore::open(dir.path()).unwrap());
        let now = Utc::now();
        store.insert_new(record("evt_fail", now), now).unwrap();
        store
            .update_status("evt_fail", EventStatus::Failed, Some("boom".into()), now)
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.reclaim("evt_fail", lease(), now))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(wins, 1);
    }
}
