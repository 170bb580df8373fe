//! Durable sync queue.
//!
//! Every mutation bound for the server enters here via [`SyncQueue::enqueue`]
//! and is persisted in the `syncQueue` collection. Status transitions of a
//! queue record are implemented only in this module:
//!
//! ```text
//! pending -> syncing -> synced
//!                    -> pending  (retry_count < max_retries)
//!                    -> failed   (retry_count >= max_retries, or permanent)
//! failed  -> pending             (manual retry)
//! syncing -> pending             (startup recovery)
//! ```
//!
//! A synced record never changes status again.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{Collection, IndexName, LocalStore, StoreTx};
use crate::error::Result;
use crate::models::{entity_key, QueueStatus, SyncOperation, SyncPayload, SyncQueueRecord};
use crate::network::NetworkMonitor;

/// How a failed attempt should be booked.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    /// Consumes a retry; back to pending until retries run out, then failed.
    Retryable {
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Consumes a retry and fails immediately (server rejected the payload).
    Permanent { error: String },
    /// Back to pending without consuming a retry (backpressure, re-auth).
    Deferred {
        error: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
}

/// Number of queue records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
}

/// md5 over device, entity key and payload; stable for identical retries.
pub fn idempotency_key(device_id: &str, entity_key: &str, payload: &SyncPayload) -> Result<String> {
    let body = serde_json::to_string(payload)?;
    let digest = md5::compute(format!("{device_id}:{entity_key}:{body}"));
    Ok(format!("{digest:x}"))
}

#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<LocalStore>,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    trigger: Arc<Notify>,
    max_retries: u32,
}

impl SyncQueue {
    pub fn new(
        store: Arc<LocalStore>,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            network,
            clock,
            trigger: Arc::new(Notify::new()),
            max_retries: max_retries.max(1),
        }
    }

    /// Persist a pending mutation and, when online, wake the drain loop.
    ///
    /// A pending record for the same entity and operation is overwritten in
    /// place instead of appending a second one. Persistence failures are
    /// returned to the caller.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        operation: SyncOperation,
        payload: SyncPayload,
    ) -> Result<SyncQueueRecord> {
        let device_id = self.store.device_id()?;
        let record = self
            .store
            .transaction(|tx| self.enqueue_in(tx, tenant_id, &device_id, operation, payload))?;
        self.schedule_drain();
        Ok(record)
    }

    /// Enqueue inside a caller-owned transaction, so the entity write and
    /// its queue record commit together. Call [`SyncQueue::schedule_drain`]
    /// after the transaction commits.
    pub fn enqueue_in(
        &self,
        tx: &StoreTx<'_>,
        tenant_id: &str,
        device_id: &str,
        operation: SyncOperation,
        payload: SyncPayload,
    ) -> Result<SyncQueueRecord> {
        let now = self.clock.now();
        let key = entity_key(payload.entity_type(), payload.entity_id(), operation);
        let idem = idempotency_key(device_id, &key, &payload)?;

        let existing = tx
            .query_by_index::<SyncQueueRecord>(IndexName::EntityKey, &key)?
            .into_iter()
            .find(|r| r.status == QueueStatus::Pending);

        let record = match existing {
            Some(mut pending) => {
                debug!(queue_id = %pending.id, entity_key = %key, "Coalescing into pending queue record");
                pending.payload = payload;
                pending.idempotency_key = idem;
                pending.updated_at = now;
                pending
            }
            None => SyncQueueRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                entity_id: payload.entity_id().to_string(),
                operation,
                payload,
                status: QueueStatus::Pending,
                retry_count: 0,
                max_retries: self.max_retries,
                last_error: None,
                idempotency_key: idem,
                created_at: now,
                updated_at: now,
                last_sync_attempt: None,
                synced_at: None,
                next_retry_at: None,
                conflict_fields: Vec::new(),
            },
        };

        tx.put(&record)?;
        Ok(record)
    }

    /// Wake the drain loop if the network is up. Never blocks.
    pub fn schedule_drain(&self) {
        if self.network.is_online() {
            self.trigger.notify_one();
        }
    }

    /// Signal the auto-sync loop waits on.
    pub fn drain_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncQueueRecord>> {
        self.store.get(id)
    }

    /// Records in `status`, oldest first.
    pub fn by_status(&self, status: QueueStatus) -> Result<Vec<SyncQueueRecord>> {
        let mut records: Vec<SyncQueueRecord> =
            self.store.query_by_index(IndexName::Status, status.as_str())?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub fn pending(&self) -> Result<Vec<SyncQueueRecord>> {
        self.by_status(QueueStatus::Pending)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let count = |status: QueueStatus| {
            self.store
                .count_by_index(Collection::SyncQueue, IndexName::Status, status.as_str())
        };
        Ok(QueueCounts {
            pending: count(QueueStatus::Pending)?,
            syncing: count(QueueStatus::Syncing)?,
            synced: count(QueueStatus::Synced)?,
            failed: count(QueueStatus::Failed)?,
        })
    }

    /// pending -> syncing. Returns `false` (and writes nothing) when the
    /// record is no longer pending.
    pub fn mark_syncing(&self, record: &mut SyncQueueRecord) -> Result<bool> {
        if !record.begin_attempt(self.clock.now()) {
            return Ok(false);
        }
        self.store.put(record)?;
        Ok(true)
    }

    /// Book a failed attempt and persist it.
    pub fn record_failure(&self, record: &mut SyncQueueRecord, failure: AttemptFailure) -> Result<()> {
        record.fail_attempt(failure, self.clock.now());
        self.store.put(record)
    }

    /// failed -> pending with a fresh retry budget. Returns how many moved.
    pub fn reset_failed(&self) -> Result<usize> {
        let now = self.clock.now();
        let failed = self.by_status(QueueStatus::Failed)?;
        let count = failed.len();
        self.store.transaction(|tx| {
            for mut record in failed {
                record.reset_for_retry(now);
                tx.put(&record)?;
            }
            Ok(())
        })?;
        if count > 0 {
            info!(count, "Requeued failed sync operations");
        }
        Ok(count)
    }

    /// syncing -> pending for records stranded by a crash or shutdown.
    pub fn recover_stuck(&self) -> Result<usize> {
        let now = self.clock.now();
        let stuck = self.by_status(QueueStatus::Syncing)?;
        let count = stuck.len();
        self.store.transaction(|tx| {
            for mut record in stuck {
                record.interrupt(now);
                tx.put(&record)?;
            }
            Ok(())
        })?;
        if count > 0 {
            warn!(count, "Recovered queue records stuck in syncing");
        }
        Ok(count)
    }

    /// Delete synced records whose `synced_at` is before `cutoff`. Pending,
    /// syncing and failed records are never purged.
    pub fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = self
            .by_status(QueueStatus::Synced)?
            .into_iter()
            .filter(|r| r.synced_at.is_some_and(|at| at < cutoff))
            .map(|r| r.id)
            .collect();
        self.store.transaction(|tx| {
            for id in &expired {
                tx.delete::<SyncQueueRecord>(id)?;
            }
            Ok(())
        })?;
        Ok(expired.len())
    }
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

impl SyncQueueRecord {
    pub(crate) fn begin_attempt(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Pending {
            return false;
        }
        self.status = QueueStatus::Syncing;
        self.last_sync_attempt = Some(now);
        self.updated_at = now;
        true
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        if self.status == QueueStatus::Synced {
            return;
        }
        self.status = QueueStatus::Synced;
        self.synced_at = Some(now);
        self.next_retry_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub(crate) fn fail_attempt(&mut self, failure: AttemptFailure, now: DateTime<Utc>) {
        if self.status == QueueStatus::Synced {
            warn!(queue_id = %self.id, "Ignoring failure for already synced queue record");
            return;
        }
        self.updated_at = now;
        match failure {
            AttemptFailure::Retryable {
                error,
                next_retry_at,
            } => {
                self.retry_count += 1;
                self.last_error = Some(error);
                if self.retry_count >= self.max_retries {
                    self.status = QueueStatus::Failed;
                    self.next_retry_at = None;
                } else {
                    self.status = QueueStatus::Pending;
                    self.next_retry_at = next_retry_at;
                }
            }
            AttemptFailure::Permanent { error } => {
                self.retry_count += 1;
                self.last_error = Some(error);
                self.status = QueueStatus::Failed;
                self.next_retry_at = None;
            }
            AttemptFailure::Deferred {
                error,
                next_retry_at,
            } => {
                self.last_error = Some(error);
                self.status = QueueStatus::Pending;
                self.next_retry_at = next_retry_at;
            }
        }
    }

    /// Conflict resolved in favour of the local copy: push it again as an
    /// update. Consumes an attempt so repeated conflicts still terminate.
    pub(crate) fn requeue_as_update(
        &mut self,
        payload: SyncPayload,
        idempotency_key: String,
        conflict_fields: Vec<String>,
        now: DateTime<Utc>,
    ) {
        if self.status == QueueStatus::Synced {
            return;
        }
        self.operation = SyncOperation::Update;
        self.payload = payload;
        self.idempotency_key = idempotency_key;
        self.conflict_fields = conflict_fields;
        self.fail_attempt(
            AttemptFailure::Retryable {
                error: "conflict: local version re-queued as update".to_string(),
                next_retry_at: None,
            },
            now,
        );
    }

    /// Conflict on a delete resolved in favour of the local copy: retry the
    /// delete as it was queued.
    pub(crate) fn requeue_delete(&mut self, conflict_fields: Vec<String>, now: DateTime<Utc>) {
        if self.status == QueueStatus::Synced {
            return;
        }
        self.conflict_fields = conflict_fields;
        self.fail_attempt(
            AttemptFailure::Retryable {
                error: "conflict: local delete re-queued".to_string(),
                next_retry_at: None,
            },
            now,
        );
    }

    fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        if self.status != QueueStatus::Failed {
            return;
        }
        self.status = QueueStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    fn interrupt(&mut self, now: DateTime<Utc>) {
        if self.status != QueueStatus::Syncing {
            return;
        }
        self.status = QueueStatus::Pending;
        self.last_error = Some("interrupted while syncing".to_string());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{PaymentMethod, PaymentRecord, PaymentStatus};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<LocalStore>,
        clock: Arc<ManualClock>,
        network: NetworkMonitor,
        queue: SyncQueue,
    }

    fn fixture(online: bool) -> Fixture {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let network = NetworkMonitor::new(online);
        let queue = SyncQueue::new(store.clone(), network.clone(), clock.clone(), 3);
        Fixture {
            store,
            clock,
            network,
            queue,
        }
    }

    fn payment(id: &str, amount: rust_decimal::Decimal) -> SyncPayload {
        SyncPayload::Payment(PaymentRecord {
            id: id.into(),
            tenant_id: "tenant-1".into(),
            invoice_id: "inv-1".into(),
            amount,
            method: PaymentMethod::Cash,
            status: PaymentStatus::Completed,
            reference: None,
            device_id: "dev-1".into(),
            created_at: Utc::now(),
            synced_at: None,
        })
    }

    #[test]
    fn test_enqueue_creates_exactly_one_pending_record() {
        let f = fixture(false);
        let record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(10)))
            .unwrap();

        assert_eq!(record.status, QueueStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 3);
        assert_eq!(f.queue.pending().unwrap().len(), 1);
        assert_eq!(f.queue.get(&record.id).unwrap(), Some(record));
    }

    #[test]
    fn test_repeated_enqueue_overwrites_pending_payload() {
        let f = fixture(false);
        let first = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(10)))
            .unwrap();
        let second = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(12)))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.idempotency_key, second.idempotency_key);
        let pending = f.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        match &pending[0].payload {
            SyncPayload::Payment(p) => assert_eq!(p.amount, dec!(12)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_enqueue_after_sync_appends_new_record() {
        let f = fixture(false);
        let mut first = f
            .queue
            .enqueue("tenant-1", SyncOperation::Update, payment("pay-1", dec!(10)))
            .unwrap();
        assert!(f.queue.mark_syncing(&mut first).unwrap());
        first.complete(f.clock.now());
        f.store.put(&first).unwrap();

        let second = f
            .queue
            .enqueue("tenant-1", SyncOperation::Update, payment("pay-1", dec!(11)))
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(
            f.queue.get(&first.id).unwrap().unwrap().status,
            QueueStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_enqueue_while_online_wakes_drain_signal() {
        let f = fixture(true);
        let signal = f.queue.drain_signal();
        f.queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        // notify_one stores a permit for the next waiter
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.notified())
            .await
            .expect("drain signal fired");
    }

    #[tokio::test]
    async fn test_enqueue_while_offline_does_not_wake_drain() {
        let f = fixture(false);
        let signal = f.queue.drain_signal();
        f.queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), signal.notified()).await;
        assert!(waited.is_err());
        assert!(!f.network.is_online());
    }

    #[test]
    fn test_retryable_failures_fail_exactly_at_max_retries() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();

        for attempt in 1..=3u32 {
            assert!(f.queue.mark_syncing(&mut record).unwrap());
            f.queue
                .record_failure(
                    &mut record,
                    AttemptFailure::Retryable {
                        error: "HTTP 503".into(),
                        next_retry_at: None,
                    },
                )
                .unwrap();
            assert_eq!(record.retry_count, attempt);
            if attempt < 3 {
                assert_eq!(record.status, QueueStatus::Pending);
            } else {
                assert_eq!(record.status, QueueStatus::Failed);
            }
        }
        assert!(!f.queue.mark_syncing(&mut record).unwrap());
    }

    #[test]
    fn test_permanent_failure_fails_immediately() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        f.queue.mark_syncing(&mut record).unwrap();
        f.queue
            .record_failure(
                &mut record,
                AttemptFailure::Permanent {
                    error: "validation failed (HTTP 422)".into(),
                },
            )
            .unwrap();
        assert_eq!(record.status, QueueStatus::Failed);
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn test_deferred_failure_does_not_consume_retry() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        f.queue.mark_syncing(&mut record).unwrap();
        let later = f.clock.now() + Duration::seconds(30);
        f.queue
            .record_failure(
                &mut record,
                AttemptFailure::Deferred {
                    error: "HTTP 429".into(),
                    next_retry_at: Some(later),
                },
            )
            .unwrap();
        assert_eq!(record.status, QueueStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.next_retry_at, Some(later));
    }

    #[test]
    fn test_synced_record_never_regresses() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        record.begin_attempt(f.clock.now());
        record.complete(f.clock.now());
        record.fail_attempt(
            AttemptFailure::Permanent {
                error: "late error".into(),
            },
            f.clock.now(),
        );
        record.interrupt(f.clock.now());
        assert_eq!(record.status, QueueStatus::Synced);
        assert!(!record.begin_attempt(f.clock.now()));
    }

    #[test]
    fn test_reset_failed_restores_retry_budget() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        f.queue.mark_syncing(&mut record).unwrap();
        f.queue
            .record_failure(&mut record, AttemptFailure::Permanent { error: "x".into() })
            .unwrap();

        assert_eq!(f.queue.reset_failed().unwrap(), 1);
        let reloaded = f.queue.get(&record.id).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Pending);
        assert_eq!(reloaded.retry_count, 0);
    }

    #[test]
    fn test_recover_stuck_moves_syncing_back_to_pending() {
        let f = fixture(false);
        let mut record = f
            .queue
            .enqueue("tenant-1", SyncOperation::Create, payment("pay-1", dec!(1)))
            .unwrap();
        f.queue.mark_syncing(&mut record).unwrap();

        assert_eq!(f.queue.recover_stuck().unwrap(), 1);
        let reloaded = f.queue.get(&record.id).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Pending);
        assert_eq!(reloaded.retry_count, 0);
        assert_eq!(f.queue.counts().unwrap().syncing, 0);
    }

    #[test]
    fn test_idempotency_key_depends_on_device_and_payload() {
        let p = payment("pay-1", dec!(5));
        let a = idempotency_key("dev-a", "payment:pay-1:create", &p).unwrap();
        let b = idempotency_key("dev-b", "payment:pay-1:create", &p).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, idempotency_key("dev-a", "payment:pay-1:create", &p).unwrap());
    }
}
