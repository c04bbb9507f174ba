use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use multipos_core::{ExpectedVersion, MovementId, TenantId};
use multipos_stock::{IdempotencyKey, StockKey, StockMovement};

/// A movement that has been durably appended to its stream.
///
/// The store assigns `movement_id`, a per-stream `sequence_number`
/// (monotonically increasing from 1, no gaps, no duplicates) and the commit
/// timestamp. Committed movements are immutable; corrections are new
/// offsetting movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedMovement {
    pub movement_id: MovementId,
    /// Monotonically increasing position in the `(tenant, key)` stream.
    pub sequence_number: u64,
    /// Commit time (storage time, distinct from the movement's business time).
    pub committed_at: DateTime<Utc>,
    pub movement: StockMovement,
}

impl CommittedMovement {
    pub fn tenant_id(&self) -> TenantId {
        self.movement.tenant_id
    }

    pub fn key(&self) -> StockKey {
        self.movement.key
    }
}

/// Outcome of an atomic batch append.
///
/// `already_applied` carries the idempotency keys the store had seen before;
/// replaying a batch after a transient failure reports the surviving lines
/// here instead of double-counting them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendReport {
    /// Newly committed movements, in input order.
    pub committed: Vec<CommittedMovement>,
    /// Idempotency keys that were already present (deduplicated replays).
    pub already_applied: Vec<IdempotencyKey>,
}

impl AppendReport {
    /// True when every line was a replay of an earlier commit.
    pub fn is_full_replay(&self) -> bool {
        self.committed.is_empty() && !self.already_applied.is_empty()
    }
}

/// Ledger store operation error.
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    /// Optimistic concurrency check failed (stale stream version).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Cross-tenant access or a batch mixing tenants.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Malformed append (empty batch, poisoned lock, bad record).
    #[error("invalid append: {0}")]
    Invalid(String),

    /// Transient storage failure; safe to retry with the same idempotency keys.
    #[error("transient storage failure: {0}")]
    Transient(String),
}

/// Append-only, tenant-scoped stock ledger.
///
/// Movements are organized into streams keyed by `(tenant, product,
/// warehouse)`. Within a stream, sequence numbers are assigned at append
/// time and define the per-key total order that snapshot updates must
/// follow. There is no global order across keys.
///
/// Implementations must:
/// - be durable before returning success from an append
/// - enforce tenant isolation (reject batches mixing tenants)
/// - deduplicate on the idempotency key `(batch_id, line_index)`
/// - make `append_batch` atomic as a set: a concurrent reader sees either
///   all of a batch's movements or none of them
pub trait LedgerStore: Send + Sync {
    /// Append a batch of movements atomically (all-or-nothing to readers).
    ///
    /// `expected` is checked against the current version of every stream the
    /// batch touches before anything is written; a mismatch fails with
    /// [`LedgerStoreError::Concurrency`]. Callers relying on deduplicated
    /// replay pass [`ExpectedVersion::Any`].
    ///
    /// Lines whose idempotency keys were committed earlier are skipped and
    /// reported in [`AppendReport::already_applied`]; the rest commit. This
    /// makes retrying a partially applied batch safe.
    fn append_batch(
        &self,
        movements: Vec<StockMovement>,
        expected: ExpectedVersion,
    ) -> Result<AppendReport, LedgerStoreError>;

    /// Read a stream in commit order, optionally starting at a timestamp.
    ///
    /// The result is finite and restartable: callers resume by passing the
    /// `committed_at` of the last movement they saw (entries at the cutoff
    /// are re-included; consumers deduplicate by sequence number).
    fn list_movements(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommittedMovement>, LedgerStoreError>;

    /// Last sequence number of a stream (0 when empty).
    fn stream_version(&self, tenant_id: TenantId, key: StockKey)
        -> Result<u64, LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn append_batch(
        &self,
        movements: Vec<StockMovement>,
        expected: ExpectedVersion,
    ) -> Result<AppendReport, LedgerStoreError> {
        (**self).append_batch(movements, expected)
    }

    fn list_movements(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommittedMovement>, LedgerStoreError> {
        (**self).list_movements(tenant_id, key, since)
    }

    fn stream_version(
        &self,
        tenant_id: TenantId,
        key: StockKey,
    ) -> Result<u64, LedgerStoreError> {
        (**self).stream_version(tenant_id, key)
    }
}
