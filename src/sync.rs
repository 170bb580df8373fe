//! Background sync engine.
//!
//! Drains the sync queue against the admin dashboard: one drain at a time,
//! oldest records first, in bounded batches. Server acknowledgements are
//! merged back into the local entity in the same transaction that marks the
//! queue record synced. Failures are booked on the queue record according to
//! their [`RetryClass`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{RetryClass, SyncAck, SyncRequest, SyncTransport, TransportError};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::conflict::{resolve_conflict, ConflictStrategy};
use crate::db::{IndexName, LocalStore, Record, StoreTx, META_DEVICE_ID};
use crate::error::Result;
use crate::models::{
    entity_key, EntityType, InvoiceRecord, InvoiceStatus, LineItemRecord, PaymentRecord,
    PaymentStatus, QueueStatus, SyncOperation, SyncPayload, SyncQueueRecord,
};
use crate::network::NetworkMonitor;
use crate::queue::{idempotency_key, AttemptFailure, SyncQueue};

// ---------------------------------------------------------------------------
// Results and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    pub synced: usize,
    pub failed: usize,
    /// Returned to pending for a later drain (backpressure, re-auth,
    /// conflict re-queue).
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the flag; nothing was done.
    InProgress,
    Offline,
    Completed(DrainSummary),
}

impl DrainOutcome {
    pub fn summary(&self) -> Option<DrainSummary> {
        match self {
            Self::Completed(summary) => Some(*summary),
            _ => None,
        }
    }
}

/// Snapshot published to observers (the cart's sync mirror).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub last_drain: Option<DrainSummary>,
}

enum ItemOutcome {
    Synced,
    Failed,
    Deferred,
    /// Deferred, and the rest of the drain should wait (auth, backpressure).
    Halt,
    /// Record vanished or left `pending` before we got to it.
    Skipped,
}

/// A spawned background loop. Dropping the handle leaves the task running;
/// call [`AutoSyncHandle::stop`] to end it.
#[derive(Debug)]
pub struct AutoSyncHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Background sync task ended abnormally");
        }
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Entity merge hooks
// ---------------------------------------------------------------------------

/// Entities that travel through the queue.
trait SyncedEntity: Record + Clone {
    /// Fold server-authoritative fields into the local copy.
    fn apply_ack(&mut self, ack: &SyncAck, now: DateTime<Utc>);

    /// Fold only server-assigned identifiers. Used when a newer local change
    /// is still queued and the local copy must otherwise stay as it is.
    fn apply_identifiers(&mut self, _ack: &SyncAck) {}

    fn into_payload(self) -> SyncPayload;

    /// Extra writes after the entity itself is marked synced.
    fn after_sync(&self, _tx: &StoreTx<'_>, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

impl SyncedEntity for InvoiceRecord {
    fn apply_ack(&mut self, ack: &SyncAck, now: DateTime<Utc>) {
        self.apply_identifiers(ack);
        if let Some(status) = ack.status.as_deref().and_then(InvoiceStatus::parse) {
            self.status = status;
        }
        self.is_offline_only = false;
        self.synced_at = Some(now);
        for line in &mut self.line_items {
            line.synced_at = Some(now);
        }
    }

    fn apply_identifiers(&mut self, ack: &SyncAck) {
        if let Some(number) = &ack.invoice_number {
            self.invoice_number = Some(number.clone());
        }
    }

    fn into_payload(self) -> SyncPayload {
        SyncPayload::Invoice(self)
    }

    fn after_sync(&self, tx: &StoreTx<'_>, now: DateTime<Utc>) -> Result<()> {
        for mut line in tx.query_by_index::<LineItemRecord>(IndexName::InvoiceId, &self.id)? {
            line.synced_at = Some(now);
            tx.put(&line)?;
        }
        Ok(())
    }
}

impl SyncedEntity for PaymentRecord {
    fn apply_ack(&mut self, ack: &SyncAck, now: DateTime<Utc>) {
        if let Some(status) = ack.status.as_deref().and_then(PaymentStatus::parse) {
            self.status = status;
        }
        self.synced_at = Some(now);
    }

    fn into_payload(self) -> SyncPayload {
        SyncPayload::Payment(self)
    }
}

impl SyncedEntity for LineItemRecord {
    fn apply_ack(&mut self, _ack: &SyncAck, now: DateTime<Utc>) {
        self.synced_at = Some(now);
    }

    fn into_payload(self) -> SyncPayload {
        SyncPayload::LineItem(self)
    }
}

/// True when another record for the same entity is still waiting to be
/// pushed, meaning the local copy is newer than what was just acknowledged.
fn has_newer_change(tx: &StoreTx<'_>, record: &SyncQueueRecord) -> Result<bool> {
    let entity_type = record.entity_type();
    for op in [SyncOperation::Create, SyncOperation::Update, SyncOperation::Delete] {
        let key = entity_key(entity_type, &record.entity_id, op);
        let newer = tx
            .query_by_index::<SyncQueueRecord>(IndexName::EntityKey, &key)?
            .into_iter()
            .any(|other| {
                other.id != record.id
                    && matches!(other.status, QueueStatus::Pending | QueueStatus::Syncing)
            });
        if newer {
            return Ok(true);
        }
    }
    Ok(false)
}

fn merge_ack<T: SyncedEntity>(
    tx: &StoreTx<'_>,
    record: &SyncQueueRecord,
    ack: &SyncAck,
    now: DateTime<Utc>,
) -> Result<()> {
    let entity_id = record.entity_id.as_str();
    let Some(mut local) = tx.get::<T>(entity_id)? else {
        warn!(
            entity_id,
            collection = T::COLLECTION.name(),
            "Synced entity no longer exists locally; nothing to merge"
        );
        return Ok(());
    };
    if has_newer_change(tx, record)? {
        debug!(
            entity_id,
            queue_id = %record.id,
            "Newer local change still queued; merging identifiers only"
        );
        local.apply_identifiers(ack);
        return tx.put(&local);
    }
    local.apply_ack(ack, now);
    local.after_sync(tx, now)?;
    tx.put(&local)
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: u64) -> u64 {
    (seed % 700) + 50
}

fn jitter_seed(queue_id: &str, attempt: u32) -> u64 {
    queue_id.bytes().fold(u64::from(attempt), |acc, b| {
        acc.wrapping_mul(31).wrapping_add(u64::from(b))
    })
}

fn offset(now: DateTime<Utc>, delay_ms: u64) -> DateTime<Utc> {
    let delay = ChronoDuration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX / 1_000));
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: SyncQueue,
    transport: Arc<dyn SyncTransport>,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    is_syncing: AtomicBool,
    last_drain: Mutex<Option<DrainSummary>>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    /// Build the engine and its queue. Records left in `syncing` by a
    /// previous run are returned to `pending` before anything else happens.
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = SyncQueue::new(
            Arc::clone(&store),
            network.clone(),
            Arc::clone(&clock),
            config.max_retries,
        );
        queue.recover_stuck()?;

        let (status_tx, _rx) = watch::channel(SyncStatus::default());
        let engine = Self {
            store,
            queue,
            transport,
            network,
            clock,
            config,
            is_syncing: AtomicBool::new(false),
            last_drain: Mutex::new(None),
            status_tx,
        };
        engine.publish_status();
        Ok(engine)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Drain eligible pending records.
    ///
    /// Returns [`DrainOutcome::InProgress`] without touching the queue or the
    /// network when another drain is running, and [`DrainOutcome::Offline`]
    /// when the network monitor reports no connectivity.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain requested while another drain is running");
            return Ok(DrainOutcome::InProgress);
        }

        let outcome = {
            let _guard = DrainGuard(&self.is_syncing);
            if !self.network.is_online() {
                debug!("Drain skipped; network offline");
                Ok(DrainOutcome::Offline)
            } else {
                self.publish_status();
                self.run_drain().await.map(DrainOutcome::Completed)
            }
        };

        if let Ok(DrainOutcome::Completed(summary)) = &outcome {
            if let Ok(mut last) = self.last_drain.lock() {
                *last = Some(*summary);
            }
        }
        self.publish_status();
        outcome
    }

    async fn run_drain(&self) -> Result<DrainSummary> {
        let device_id = self.store.device_id()?;
        let now = self.clock.now();
        let ready: Vec<String> = self
            .queue
            .pending()?
            .into_iter()
            .filter(|r| r.next_retry_at.map_or(true, |at| at <= now))
            .map(|r| r.id)
            .collect();

        let mut summary = DrainSummary::default();
        'batches: for batch in ready.chunks(self.config.batch_size.max(1)) {
            for queue_id in batch {
                if !self.network.is_online() {
                    info!("Network lost mid-drain; leaving remaining items pending");
                    break 'batches;
                }
                match self.process_item(queue_id, &device_id).await? {
                    ItemOutcome::Synced => summary.synced += 1,
                    ItemOutcome::Failed => summary.failed += 1,
                    ItemOutcome::Deferred => summary.deferred += 1,
                    ItemOutcome::Skipped => {}
                    ItemOutcome::Halt => {
                        summary.deferred += 1;
                        break 'batches;
                    }
                }
            }
            debug!(batch_len = batch.len(), "Sync batch processed");
        }

        self.store.set_last_sync_time(self.clock.now())?;
        if summary.synced + summary.failed + summary.deferred > 0 {
            info!(
                synced = summary.synced,
                failed = summary.failed,
                deferred = summary.deferred,
                "Drain complete"
            );
        }
        Ok(summary)
    }

    async fn process_item(&self, queue_id: &str, device_id: &str) -> Result<ItemOutcome> {
        let Some(mut record) = self.queue.get(queue_id)? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !self.queue.mark_syncing(&mut record)? {
            return Ok(ItemOutcome::Skipped);
        }

        let request = match SyncRequest::from_record(&record, device_id) {
            Ok(request) => request,
            Err(e) => {
                self.queue.record_failure(
                    &mut record,
                    AttemptFailure::Permanent {
                        error: format!("payload could not be encoded: {e}"),
                    },
                )?;
                return Ok(ItemOutcome::Failed);
            }
        };

        debug!(
            queue_id = %record.id,
            entity_key = %record.entity_key(),
            attempt = record.retry_count + 1,
            "Pushing queue record"
        );

        match self.transport.send(&request).await {
            Ok(ack) => {
                self.apply_success(&mut record, &ack)?;
                Ok(ItemOutcome::Synced)
            }
            Err(err) => self.apply_failure(&mut record, &err),
        }
    }

    fn apply_success(&self, record: &mut SyncQueueRecord, ack: &SyncAck) -> Result<()> {
        let now = self.clock.now();
        self.store.transaction(|tx| {
            if record.operation != SyncOperation::Delete {
                match record.entity_type() {
                    EntityType::Invoice => merge_ack::<InvoiceRecord>(tx, &*record, ack, now)?,
                    EntityType::Payment => merge_ack::<PaymentRecord>(tx, &*record, ack, now)?,
                    EntityType::LineItem => merge_ack::<LineItemRecord>(tx, &*record, ack, now)?,
                }
            }
            record.complete(now);
            tx.put(&*record)
        })?;
        debug!(queue_id = %record.id, "Queue record synced");
        Ok(())
    }

    fn apply_failure(&self, record: &mut SyncQueueRecord, err: &TransportError) -> Result<ItemOutcome> {
        let now = self.clock.now();
        let error = err.to_string();

        match err.retry_class() {
            RetryClass::Retryable => {
                let attempt = record.retry_count + 1;
                let next_retry_at = self.next_retry_at(now, attempt, &record.id);
                warn!(
                    queue_id = %record.id,
                    attempt,
                    max_retries = record.max_retries,
                    error = %error,
                    "Sync attempt failed"
                );
                self.queue.record_failure(
                    record,
                    AttemptFailure::Retryable {
                        error,
                        next_retry_at,
                    },
                )?;
                if record.status == QueueStatus::Failed {
                    warn!(queue_id = %record.id, "Queue record exhausted its retries");
                }
                Ok(ItemOutcome::Failed)
            }
            RetryClass::Permanent => {
                warn!(queue_id = %record.id, error = %error, "Server rejected queue record; not retrying");
                self.queue
                    .record_failure(record, AttemptFailure::Permanent { error })?;
                Ok(ItemOutcome::Failed)
            }
            RetryClass::Backpressure => {
                let requested_ms = err
                    .retry_after()
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or(self.config.retry_delay_ms);
                let delay_ms = requested_ms.min(self.config.max_retry_delay_ms);
                info!(queue_id = %record.id, delay_ms, "Server backpressure; deferring sync");
                self.queue.record_failure(
                    record,
                    AttemptFailure::Deferred {
                        error,
                        next_retry_at: Some(offset(now, delay_ms)),
                    },
                )?;
                Ok(ItemOutcome::Halt)
            }
            RetryClass::ReauthRequired => {
                warn!(
                    queue_id = %record.id,
                    error = %error,
                    "Credentials rejected; pausing sync until re-authenticated"
                );
                self.queue.record_failure(
                    record,
                    AttemptFailure::Deferred {
                        error,
                        next_retry_at: None,
                    },
                )?;
                Ok(ItemOutcome::Halt)
            }
            RetryClass::Conflict => self.settle_conflict(record, err),
        }
    }

    /// Delay before the attempt after `attempt`: retry_delay × 2^(attempt−1),
    /// capped at max_retry_delay, plus jitter. `None` when no delay is
    /// configured.
    fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32, queue_id: &str) -> Option<DateTime<Utc>> {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .config
            .retry_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_retry_delay_ms);
        if delay_ms == 0 {
            return None;
        }
        let jitter = deterministic_jitter_ms(jitter_seed(queue_id, attempt));
        Some(offset(now, delay_ms.saturating_add(jitter)))
    }

    fn settle_conflict(&self, record: &mut SyncQueueRecord, err: &TransportError) -> Result<ItemOutcome> {
        let Some(server) = err.server_version().cloned() else {
            warn!(queue_id = %record.id, "Conflict without a server version; failing queue record");
            self.queue.record_failure(
                record,
                AttemptFailure::Permanent {
                    error: err.to_string(),
                },
            )?;
            return Ok(ItemOutcome::Failed);
        };

        match record.payload.clone() {
            SyncPayload::Invoice(local) => self.settle_typed(record, local, server),
            SyncPayload::Payment(local) => self.settle_typed(record, local, server),
            SyncPayload::LineItem(local) => self.settle_typed(record, local, server),
        }
    }

    fn settle_typed<T: SyncedEntity>(
        &self,
        record: &mut SyncQueueRecord,
        queued: T,
        server: Value,
    ) -> Result<ItemOutcome> {
        let server: T = match serde_json::from_value(server) {
            Ok(server) => server,
            Err(e) => {
                self.queue.record_failure(
                    record,
                    AttemptFailure::Permanent {
                        error: format!("unreadable server version in conflict response: {e}"),
                    },
                )?;
                return Ok(ItemOutcome::Failed);
            }
        };

        let strategy = self.config.conflict_strategy;
        let device_id = self.store.device_id()?;
        let local = self.store.get::<T>(&record.entity_id)?.unwrap_or(queued);
        let resolution = resolve_conflict(&local, &server, strategy)?;
        let now = self.clock.now();
        info!(
            queue_id = %record.id,
            strategy = strategy.as_str(),
            fields = ?resolution.conflicting_fields,
            "Resolving sync conflict"
        );

        if !resolution.push_local {
            let mut resolved = resolution.record;
            resolved.apply_ack(&SyncAck::default(), now);
            self.store.transaction(|tx| {
                resolved.after_sync(tx, now)?;
                tx.put(&resolved)?;
                record.complete(now);
                tx.put(&*record)
            })?;
            return Ok(ItemOutcome::Synced);
        }

        let fields = resolution.conflicting_fields;
        if record.operation == SyncOperation::Delete {
            self.store.transaction(|tx| {
                record.requeue_delete(fields, now);
                tx.put(&*record)
            })?;
        } else {
            let resolved = resolution.record;
            let payload = resolved.clone().into_payload();
            let key = entity_key(payload.entity_type(), payload.entity_id(), SyncOperation::Update);
            let idem = idempotency_key(&device_id, &key, &payload)?;
            self.store.transaction(|tx| {
                if strategy == ConflictStrategy::Merge {
                    tx.put(&resolved)?;
                }
                record.requeue_as_update(payload, idem, fields, now);
                tx.put(&*record)
            })?;
        }

        if record.status == QueueStatus::Failed {
            Ok(ItemOutcome::Failed)
        } else {
            Ok(ItemOutcome::Deferred)
        }
    }

    /// Move every failed record back to pending with a fresh retry budget,
    /// then drain.
    pub async fn retry_failed_operations(&self) -> Result<DrainOutcome> {
        let count = self.queue.reset_failed()?;
        debug!(count, "Failed operations reset for retry");
        self.publish_status();
        self.drain().await
    }

    /// Delete synced queue records older than `days_old` days. Returns how
    /// many were removed.
    pub fn cleanup_old_records(&self, days_old: i64) -> Result<usize> {
        let window = ChronoDuration::try_days(days_old.max(0)).unwrap_or(ChronoDuration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.queue.purge_synced_before(cutoff)?;
        if removed > 0 {
            info!(removed, days_old, "Cleaned up synced queue records");
        }
        self.publish_status();
        Ok(removed)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let counts = self.queue.counts()?;
        let last_drain = *self.last_drain.lock()?;
        Ok(SyncStatus {
            is_online: self.network.is_online(),
            is_syncing: self.is_syncing(),
            pending: counts.pending,
            syncing: counts.syncing,
            synced: counts.synced,
            failed: counts.failed,
            last_sync_time: self.store.last_sync_time()?,
            device_id: self.store.get_metadata(META_DEVICE_ID)?,
            last_drain,
        })
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Recompute the status snapshot and notify subscribers if it changed.
    pub fn publish_status(&self) {
        match self.status() {
            Ok(status) => {
                self.status_tx.send_if_modified(|current| {
                    if *current == status {
                        false
                    } else {
                        *current = status;
                        true
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to read sync status"),
        }
    }

    async fn run_scheduled_drain(&self, trigger: &'static str) {
        match self.drain().await {
            Ok(outcome) => debug!(trigger, ?outcome, "Scheduled drain finished"),
            Err(e) => warn!(trigger, error = %e, "Scheduled drain failed"),
        }
    }

    /// Drain every `interval` and whenever an enqueue signals new work.
    pub fn start_auto_sync(self: &Arc<Self>, interval: Duration) -> AutoSyncHandle {
        let engine = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let signal = self.queue.drain_signal();

        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Auto sync started");
            let period = if interval.is_zero() {
                Duration::from_secs(1)
            } else {
                interval
            };
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let trigger = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => "interval",
                    _ = signal.notified() => "enqueue",
                };
                engine.run_scheduled_drain(trigger).await;
            }
            info!("Auto sync stopped");
        });

        AutoSyncHandle::new(cancel, task)
    }

    /// Drain immediately on every offline → online transition.
    pub fn watch_network(self: &Arc<Self>) -> AutoSyncHandle {
        let engine = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut online_rx = self.network.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        engine.publish_status();
                        if online {
                            info!("Network restored; resuming queued sync");
                            engine.run_scheduled_drain("reconnect").await;
                        }
                    }
                }
            }
        });

        AutoSyncHandle::new(cancel, task)
    }
}
