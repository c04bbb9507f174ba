//! Transaction coordination: all-or-nothing application of movement batches.
//!
//! Pipeline per submitted batch: take the batch's per-pair locks → read base
//! quantities → validate every line (with in-batch running effects) → append
//! atomically → project in commit order → commit. Any validation failure
//! rolls the whole batch back with zero ledger mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use multipos_core::{ActorId, BatchId, DomainError, ExpectedVersion, ReservationId, TenantId};
use multipos_stock::{
    validate_batch, BatchState, MovementBatch, ReferenceDoc, StockKey, StockMovement,
    ValidationError,
};

use crate::ledger_store::{CommittedMovement, LedgerStore, LedgerStoreError};
use crate::projection::{ProjectionError, StockLevel, StockLevelProjection};
use crate::read_model::TenantStore;
use crate::reservations::HoldBook;

/// Result of a committed (or replayed) batch.
#[derive(Debug)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    /// Newly committed movements, in batch line order.
    pub committed: Vec<CommittedMovement>,
    /// Lines that were already applied by an earlier attempt.
    pub already_applied: usize,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Validation failed; the batch is rolled back and must not be retried.
    #[error("batch rejected at line {line_index:?}: {error}")]
    Rejected {
        line_index: Option<u32>,
        error: ValidationError,
    },

    /// The batch was in the wrong state for the requested operation.
    #[error("invalid batch state: {0}")]
    InvalidState(#[from] DomainError),

    /// Durable append failed transiently. The validated movement set is
    /// cached; call `resubmit` with the same batch to retry the append
    /// without re-validation.
    #[error("transient storage failure, resubmit to retry: {0}")]
    StorageTransient(String),

    /// Non-retryable store failure; the batch is rolled back.
    #[error("ledger store failure: {0}")]
    Store(LedgerStoreError),

    /// Snapshot update failed after a successful append.
    #[error("projection update failed: {0}")]
    Projection(#[from] ProjectionError),

    /// `resubmit` was called for a batch with no cached validation result.
    #[error("no pending append for batch {0}")]
    UnknownBatch(BatchId),
}

type LockKey = (TenantId, StockKey);

/// A validated movement set waiting for a retryable append.
#[derive(Debug)]
struct PendingAppend {
    movements: Vec<StockMovement>,
    stored_at: DateTime<Utc>,
}

/// Groups the line items of a sale/purchase/transfer/return into one atomic
/// unit with a single commit/abort outcome.
///
/// Concurrency discipline: an exclusive lock per `(tenant, product,
/// warehouse)` pair is held for the validate-then-append-then-project
/// sequence. Only the pairs the batch touches are locked, acquired in sorted
/// order so overlapping batches cannot deadlock. No lock is ever held across
/// an external collaborator call.
pub struct BatchCoordinator<L, S>
where
    L: LedgerStore,
    S: TenantStore<StockKey, StockLevel>,
{
    ledger: L,
    projection: Arc<StockLevelProjection<S>>,
    /// Active reservation holds; subtracted during validation so sales
    /// cannot consume reserved units.
    holds: Arc<HoldBook>,
    pair_locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    /// Validated-but-not-yet-durable movement sets, kept for `resubmit`.
    pending: Mutex<HashMap<BatchId, PendingAppend>>,
}

impl<L, S> BatchCoordinator<L, S>
where
    L: LedgerStore,
    S: TenantStore<StockKey, StockLevel>,
{
    pub fn new(ledger: L, projection: Arc<StockLevelProjection<S>>) -> Self {
        Self {
            ledger,
            projection,
            holds: Arc::new(HoldBook::default()),
            pair_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn projection(&self) -> &StockLevelProjection<S> {
        &self.projection
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Hold registry shared with the reservation manager.
    pub fn holds(&self) -> &Arc<HoldBook> {
        &self.holds
    }

    /// Open a batch for one business document.
    pub fn begin_batch(
        &self,
        tenant_id: TenantId,
        reference: ReferenceDoc,
        actor_id: ActorId,
    ) -> MovementBatch {
        MovementBatch::begin(tenant_id, reference, actor_id)
    }

    /// Validate and commit a batch. All lines pass or none apply.
    pub fn submit(&self, batch: &mut MovementBatch) -> Result<BatchReceipt, SubmitError> {
        self.submit_exempting(batch, None)
    }

    /// `submit` with one hold exempted from the availability computation
    /// (a reservation consuming its own held units).
    pub(crate) fn submit_exempting(
        &self,
        batch: &mut MovementBatch,
        exempt: Option<ReservationId>,
    ) -> Result<BatchReceipt, SubmitError> {
        batch.begin_validation()?;

        let tenant_id = batch.tenant_id();
        let keys = Self::distinct_keys(batch);
        let handles = self.lock_handles(tenant_id, &keys);
        let _guards = Self::acquire(&handles);

        // Base snapshot under the pair locks, with held units subtracted so
        // no line can consume stock reserved for someone else. In-batch
        // running effects are layered on top by the validator.
        let base: HashMap<StockKey, i64> = keys
            .iter()
            .map(|k| {
                let on_hand = self.projection.current_quantity(tenant_id, *k);
                let held = self.holds.held_excluding(tenant_id, *k, exempt);
                (*k, on_hand - held)
            })
            .collect();

        if let Err(rejection) = validate_batch(batch.lines(), &base) {
            batch.mark_rolled_back()?;
            info!(
                batch_id = %batch.id(),
                reference_no = batch.reference().reference_no(),
                line_index = ?rejection.line_index,
                error = %rejection.error,
                "batch rejected, rolled back"
            );
            return Err(SubmitError::Rejected {
                line_index: rejection.line_index,
                error: rejection.error,
            });
        }

        let movements = batch.movements(Utc::now());
        self.commit_validated(batch, movements)
    }

    /// Retry the durable append after a transient failure.
    ///
    /// Uses the validation result cached by the failed `submit`; lines are
    /// not re-validated, and the unchanged idempotency keys make the retry
    /// safe even if the earlier attempt partially survived.
    pub fn resubmit(&self, batch: &mut MovementBatch) -> Result<BatchReceipt, SubmitError> {
        if batch.state() != BatchState::Validating {
            return Err(SubmitError::InvalidState(DomainError::invariant(format!(
                "cannot resubmit batch in state {:?}",
                batch.state()
            ))));
        }

        let movements = {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending
                .get(&batch.id())
                .map(|p| p.movements.clone())
                .ok_or(SubmitError::UnknownBatch(batch.id()))?
        };

        let tenant_id = batch.tenant_id();
        let keys = Self::distinct_keys(batch);
        let handles = self.lock_handles(tenant_id, &keys);
        let _guards = Self::acquire(&handles);

        self.commit_validated(batch, movements)
    }

    /// Abort a batch before it commits. Committed batches can only be
    /// reversed by a new offsetting batch.
    pub fn abort(&self, batch: &mut MovementBatch) -> Result<(), SubmitError> {
        batch.mark_rolled_back()?;
        self.forget_pending(batch.id());
        debug!(batch_id = %batch.id(), "batch aborted");
        Ok(())
    }

    /// Drop cached movement sets of transiently failed batches that were
    /// never resubmitted or aborted. Returns how many were dropped.
    pub fn expire_pending(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = pending.len();
        pending.retain(|_, p| p.stored_at > cutoff);
        let dropped = before - pending.len();
        if dropped > 0 {
            warn!(dropped, "dropped abandoned pending appends");
        }
        dropped
    }

    fn commit_validated(
        &self,
        batch: &mut MovementBatch,
        movements: Vec<StockMovement>,
    ) -> Result<BatchReceipt, SubmitError> {
        match self
            .ledger
            .append_batch(movements.clone(), ExpectedVersion::Any)
        {
            Ok(report) => {
                // Snapshot updates in commit order, still under the pair
                // locks: per-key projection order equals commit order.
                for committed in &report.committed {
                    self.projection.apply(committed)?;
                }

                batch.mark_committed()?;
                self.forget_pending(batch.id());
                info!(
                    batch_id = %batch.id(),
                    reference_no = batch.reference().reference_no(),
                    lines = report.committed.len(),
                    replayed = report.already_applied.len(),
                    "batch committed"
                );
                Ok(BatchReceipt {
                    batch_id: batch.id(),
                    already_applied: report.already_applied.len(),
                    committed: report.committed,
                })
            }
            Err(LedgerStoreError::Transient(msg)) => {
                // Keep the validated set; the caller retries with the same
                // idempotency keys and no re-validation.
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                pending.insert(
                    batch.id(),
                    PendingAppend {
                        movements,
                        stored_at: Utc::now(),
                    },
                );
                warn!(batch_id = %batch.id(), error = %msg, "transient append failure, batch pending");
                Err(SubmitError::StorageTransient(msg))
            }
            Err(other) => {
                batch.mark_rolled_back()?;
                self.forget_pending(batch.id());
                Err(SubmitError::Store(other))
            }
        }
    }

    fn distinct_keys(batch: &MovementBatch) -> Vec<StockKey> {
        let mut keys: Vec<StockKey> = batch.lines().iter().map(|l| l.key).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Lock handle for a single pair (reservation checks take it too, so a
    /// reserve and a commit on the same pair serialize).
    pub(crate) fn pair_lock(&self, tenant_id: TenantId, key: StockKey) -> Arc<Mutex<()>> {
        let mut map = self
            .pair_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry((tenant_id, key)).or_default().clone()
    }

    fn lock_handles(&self, tenant_id: TenantId, keys: &[StockKey]) -> Vec<Arc<Mutex<()>>> {
        let mut map = self
            .pair_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.iter()
            .map(|k| map.entry((tenant_id, *k)).or_default().clone())
            .collect()
    }

    /// Lock the batch's pairs in sorted key order (deadlock avoidance).
    fn acquire(handles: &[Arc<Mutex<()>>]) -> Vec<MutexGuard<'_, ()>> {
        handles
            .iter()
            .map(|h| h.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect()
    }

    fn forget_pending(&self, batch_id: BatchId) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.remove(&batch_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use multipos_core::{ProductId, WarehouseId};
    use multipos_stock::MovementKind;

    use crate::ledger_store::{AppendReport, InMemoryLedgerStore};
    use crate::read_model::InMemoryTenantStore;

    type Store = Arc<InMemoryTenantStore<StockKey, StockLevel>>;

    fn coordinator() -> BatchCoordinator<Arc<InMemoryLedgerStore>, Store> {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let projection = Arc::new(StockLevelProjection::new(Arc::new(
            InMemoryTenantStore::new(),
        )));
        BatchCoordinator::new(ledger, projection)
    }

    fn sale_ref(n: u32) -> ReferenceDoc {
        ReferenceDoc::Sale {
            reference_no: format!("sale-{n:04}"),
        }
    }

    fn purchase_ref(n: u32) -> ReferenceDoc {
        ReferenceDoc::Purchase {
            reference_no: format!("purchase-{n:04}"),
        }
    }

    fn stock_up<L, S>(
        coordinator: &BatchCoordinator<L, S>,
        tenant: TenantId,
        key: StockKey,
        qty: i64,
    ) where
        L: LedgerStore,
        S: TenantStore<StockKey, StockLevel>,
    {
        let mut batch = coordinator.begin_batch(tenant, purchase_ref(0), ActorId::new());
        batch
            .add_line(key, qty, MovementKind::Purchase, false)
            .unwrap();
        coordinator.submit(&mut batch).unwrap();
    }

    #[test]
    fn committed_batch_updates_snapshot() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        stock_up(&c, tenant, key, 10);
        assert_eq!(c.projection().current_quantity(tenant, key), 10);

        let mut sale = c.begin_batch(tenant, sale_ref(1), ActorId::new());
        sale.add_line(key, -4, MovementKind::Sale, false).unwrap();
        let receipt = c.submit(&mut sale).unwrap();

        assert_eq!(receipt.committed.len(), 1);
        assert_eq!(sale.state(), BatchState::Committed);
        assert_eq!(c.projection().current_quantity(tenant, key), 6);
    }

    #[test]
    fn rejected_batch_leaves_ledger_and_snapshot_untouched() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        stock_up(&c, tenant, key, 3);

        let mut sale = c.begin_batch(tenant, sale_ref(1), ActorId::new());
        sale.add_line(key, -5, MovementKind::Sale, false).unwrap();
        let err = c.submit(&mut sale).unwrap_err();

        assert!(matches!(err, SubmitError::Rejected { .. }));
        assert_eq!(sale.state(), BatchState::RolledBack);
        assert_eq!(c.projection().current_quantity(tenant, key), 3);
        assert_eq!(c.ledger().stream_version(tenant, key).unwrap(), 1);
    }

    #[test]
    fn partial_failure_applies_nothing() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key_a = StockKey::new(ProductId::new(), WarehouseId::new());
        let key_b = StockKey::new(ProductId::new(), WarehouseId::new());

        stock_up(&c, tenant, key_a, 10);
        // key_b has nothing; the second line must sink the whole batch.
        let mut sale = c.begin_batch(tenant, sale_ref(1), ActorId::new());
        sale.add_line(key_a, -2, MovementKind::Sale, false).unwrap();
        sale.add_line(key_b, -1, MovementKind::Sale, false).unwrap();
        let err = c.submit(&mut sale).unwrap_err();

        assert!(matches!(
            err,
            SubmitError::Rejected {
                line_index: Some(1),
                ..
            }
        ));
        assert_eq!(c.projection().current_quantity(tenant, key_a), 10);
        assert_eq!(c.projection().current_quantity(tenant, key_b), 0);
    }

    #[test]
    fn batch_may_consume_stock_it_adds() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, purchase_ref(1), ActorId::new());
        batch.add_line(key, 10, MovementKind::Purchase, false).unwrap();
        batch.add_line(key, -10, MovementKind::Sale, false).unwrap();
        c.submit(&mut batch).unwrap();

        assert_eq!(c.projection().current_quantity(tenant, key), 0);
    }

    #[test]
    fn abort_before_commit_is_allowed() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, sale_ref(1), ActorId::new());
        batch.add_line(key, -1, MovementKind::Sale, false).unwrap();
        c.abort(&mut batch).unwrap();

        assert_eq!(batch.state(), BatchState::RolledBack);
        assert!(c.submit(&mut batch).is_err());
    }

    /// Ledger store decorator that fails the first N batch appends.
    struct FlakyLedgerStore {
        inner: InMemoryLedgerStore,
        failures_left: AtomicUsize,
    }

    impl FlakyLedgerStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryLedgerStore::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }
    }

    impl LedgerStore for FlakyLedgerStore {
        fn append_batch(
            &self,
            movements: Vec<StockMovement>,
            expected: ExpectedVersion,
        ) -> Result<AppendReport, LedgerStoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LedgerStoreError::Transient("simulated outage".to_string()));
            }
            self.inner.append_batch(movements, expected)
        }

        fn list_movements(
            &self,
            tenant_id: TenantId,
            key: StockKey,
            since: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<Vec<CommittedMovement>, LedgerStoreError> {
            self.inner.list_movements(tenant_id, key, since)
        }

        fn stream_version(
            &self,
            tenant_id: TenantId,
            key: StockKey,
        ) -> Result<u64, LedgerStoreError> {
            self.inner.stream_version(tenant_id, key)
        }
    }

    #[test]
    fn transient_append_failure_is_resubmittable_without_revalidation() {
        let ledger = Arc::new(FlakyLedgerStore::new(1));
        let projection = Arc::new(StockLevelProjection::new(Arc::new(
            InMemoryTenantStore::new(),
        )));
        let c = BatchCoordinator::new(ledger, projection);
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, purchase_ref(1), ActorId::new());
        batch.add_line(key, 10, MovementKind::Purchase, false).unwrap();

        let err = c.submit(&mut batch).unwrap_err();
        assert!(matches!(err, SubmitError::StorageTransient(_)));
        assert_eq!(batch.state(), BatchState::Validating);

        let receipt = c.resubmit(&mut batch).unwrap();
        assert_eq!(receipt.committed.len(), 1);
        assert_eq!(batch.state(), BatchState::Committed);
        assert_eq!(c.projection().current_quantity(tenant, key), 10);
    }

    #[test]
    fn resubmit_without_pending_append_is_rejected() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, purchase_ref(1), ActorId::new());
        batch.add_line(key, 10, MovementKind::Purchase, false).unwrap();
        batch.begin_validation().unwrap();

        let err = c.resubmit(&mut batch).unwrap_err();
        assert!(matches!(err, SubmitError::UnknownBatch(_)));
    }

    #[test]
    fn abandoned_pending_append_is_expired() {
        let ledger = Arc::new(FlakyLedgerStore::new(1));
        let projection = Arc::new(StockLevelProjection::new(Arc::new(
            InMemoryTenantStore::new(),
        )));
        let c = BatchCoordinator::new(ledger, projection);
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, purchase_ref(1), ActorId::new());
        batch.add_line(key, 10, MovementKind::Purchase, false).unwrap();
        let err = c.submit(&mut batch).unwrap_err();
        assert!(matches!(err, SubmitError::StorageTransient(_)));

        // A fresh entry survives a sweep with a generous TTL.
        assert_eq!(c.expire_pending(Duration::from_secs(600)), 0);
        // With a zero TTL the abandoned set is dropped.
        assert_eq!(c.expire_pending(Duration::from_secs(0)), 1);

        let err = c.resubmit(&mut batch).unwrap_err();
        assert!(matches!(err, SubmitError::UnknownBatch(_)));
    }

    #[test]
    fn submitting_the_same_movements_twice_has_one_quantity_effect() {
        let c = coordinator();
        let tenant = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());

        let mut batch = c.begin_batch(tenant, purchase_ref(1), ActorId::new());
        batch.add_line(key, 10, MovementKind::Purchase, false).unwrap();
        c.submit(&mut batch).unwrap();

        // Replay the identical movement set straight at the store, as a
        // crashed-and-retried writer would.
        let movements = batch.movements(Utc::now());
        let report = c
            .ledger()
            .append_batch(movements, ExpectedVersion::Any)
            .unwrap();
        assert!(report.is_full_replay());
        assert_eq!(c.projection().current_quantity(tenant, key), 10);
    }
}
