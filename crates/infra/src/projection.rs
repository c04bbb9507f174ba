//! Quantity projection: cached on-hand stock per `(product, warehouse)`.
//!
//! The ledger is the source of truth; this read model is disposable and can
//! be rebuilt for any pair by replaying its movement stream.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{error, info, warn};

use multipos_core::TenantId;
use multipos_stock::StockKey;

use crate::ledger_store::{CommittedMovement, LedgerStore, LedgerStoreError};
use crate::read_model::TenantStore;

/// Queryable stock read model: current quantity for one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub key: StockKey,
    pub quantity: i64,
}

/// Snapshot diverged from ledger replay. Fatal to the affected pair only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyError {
    pub key: StockKey,
    pub cached: i64,
    pub replayed: i64,
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A gap in the stream: movements must be applied in commit order.
    #[error("non-monotonic sequence for {key} (last={last}, found={found})")]
    NonMonotonicSequence {
        key: StockKey,
        last: u64,
        found: u64,
    },

    /// The cached quantity does not match a full replay of the ledger.
    #[error("snapshot diverged for {}: cached {}, replayed {}", .0.key, .0.cached, .0.replayed)]
    Consistency(ConsistencyError),

    #[error("ledger read failed: {0}")]
    Store(#[from] LedgerStoreError),
}

/// Stream cursor per `(tenant, key)` to support at-least-once delivery.
type CursorKey = (TenantId, StockKey);

/// Incrementally maintained stock snapshot.
///
/// - Idempotent: replays at or below the cursor are ignored.
/// - Ordered: movements for one pair must arrive in commit order; pairs
///   never block each other.
/// - Disposable: [`StockLevelProjection::rebuild`] recomputes any pair from
///   the ledger and must agree with the incremental result.
#[derive(Debug)]
pub struct StockLevelProjection<S>
where
    S: TenantStore<StockKey, StockLevel>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> StockLevelProjection<S>
where
    S: TenantStore<StockKey, StockLevel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Current on-hand quantity for one pair (0 when never moved).
    pub fn current_quantity(&self, tenant_id: TenantId, key: StockKey) -> i64 {
        self.store.get(tenant_id, &key).map(|l| l.quantity).unwrap_or(0)
    }

    pub fn level(&self, tenant_id: TenantId, key: StockKey) -> Option<StockLevel> {
        self.store.get(tenant_id, &key)
    }

    /// All known levels for a tenant.
    pub fn list(&self, tenant_id: TenantId) -> Vec<StockLevel> {
        self.store.list(tenant_id)
    }

    /// Apply one committed movement to the snapshot.
    ///
    /// Must be called in commit order per pair (the coordinator holds the
    /// pair's lock across append + apply, which guarantees this).
    pub fn apply(&self, committed: &CommittedMovement) -> Result<(), ProjectionError> {
        let tenant_id = committed.tenant_id();
        let key = committed.key();
        let seq = committed.sequence_number;

        let mut cursors = self
            .cursors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let last = *cursors.get(&(tenant_id, key)).unwrap_or(&0);

        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        if seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { key, last, found: seq });
        }

        let mut level = self
            .store
            .get(tenant_id, &key)
            .unwrap_or(StockLevel { key, quantity: 0 });
        level.quantity += committed.movement.delta;

        if level.quantity < 0 {
            // Only reachable through an admin-override adjustment.
            warn!(
                tenant_id = %tenant_id,
                key = %key,
                quantity = level.quantity,
                movement_type = committed.movement.movement_type(),
                "stock level below zero after override adjustment"
            );
        }

        self.store.upsert(tenant_id, key, level);
        cursors.insert((tenant_id, key), seq);
        Ok(())
    }

    /// Recompute one pair by folding its full movement history.
    ///
    /// Returns the rebuilt quantity. The result must equal what incremental
    /// updates produced; `verify` checks exactly that.
    pub fn rebuild<L: LedgerStore>(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        ledger: &L,
    ) -> Result<i64, ProjectionError> {
        let history = ledger.list_movements(tenant_id, key, None)?;

        let mut quantity = 0i64;
        let mut last_seq = 0u64;
        for committed in &history {
            quantity += committed.movement.delta;
            last_seq = committed.sequence_number;
        }

        self.store.upsert(tenant_id, key, StockLevel { key, quantity });
        let mut cursors = self
            .cursors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cursors.insert((tenant_id, key), last_seq);

        Ok(quantity)
    }

    /// Throw away and recompute every known pair for a tenant.
    ///
    /// Used after a restore or when verification has flagged widespread
    /// divergence: the tenant's snapshot rows and cursors are dropped, then
    /// each previously known pair is refolded from the ledger.
    pub fn rebuild_tenant<L: LedgerStore>(
        &self,
        tenant_id: TenantId,
        ledger: &L,
    ) -> Result<Vec<StockLevel>, ProjectionError> {
        let keys: Vec<StockKey> = self.store.list(tenant_id).iter().map(|l| l.key).collect();

        self.store.clear_tenant(tenant_id);
        {
            let mut cursors = self
                .cursors
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cursors.retain(|(t, _), _| *t != tenant_id);
        }

        for key in &keys {
            self.rebuild(tenant_id, *key, ledger)?;
        }

        info!(tenant_id = %tenant_id, pairs = keys.len(), "tenant snapshot rebuilt");
        Ok(self.store.list(tenant_id))
    }

    /// Compare the cached quantity against a full ledger replay.
    ///
    /// Divergence is fatal to this pair only: it is logged for operator
    /// review and the pair is force-rebuilt from the ledger, then the
    /// violation is surfaced. It is never silently patched.
    pub fn verify<L: LedgerStore>(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        ledger: &L,
    ) -> Result<(), ProjectionError> {
        let cached = self.current_quantity(tenant_id, key);
        let replayed: i64 = ledger
            .list_movements(tenant_id, key, None)?
            .iter()
            .map(|m| m.movement.delta)
            .sum();

        if cached == replayed {
            return Ok(());
        }

        error!(
            tenant_id = %tenant_id,
            key = %key,
            cached,
            replayed,
            "snapshot diverged from ledger; forcing rebuild"
        );
        self.rebuild(tenant_id, key, ledger)?;

        Err(ProjectionError::Consistency(ConsistencyError {
            key,
            cached,
            replayed,
        }))
    }
}
