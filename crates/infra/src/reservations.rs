//! Short-lived stock holds for in-progress checkouts.
//!
//! Reservations subtract from availability without touching the ledger; an
//! expired or released hold restores availability immediately. State is
//! in-memory and best-effort across restarts.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use multipos_core::{ActorId, ReservationId, TenantId};
use multipos_stock::{MovementKind, ReferenceDoc, StockKey};

use crate::coordinator::{BatchCoordinator, BatchReceipt, SubmitError};
use crate::ledger_store::LedgerStore;
use crate::projection::StockLevel;
use crate::read_model::TenantStore;

/// How long a transiently failed batch may sit unclaimed before the sweep
/// drops its cached movement set.
const PENDING_APPEND_TTL: Duration = Duration::from_secs(600);

/// An active hold on availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub key: StockKey,
    pub qty: i64,
    pub actor_id: ActorId,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Shared registry of active holds.
///
/// The coordinator consults it during validation so a committed sale can
/// never consume units held for someone else; the reservation manager owns
/// the hold lifecycle. Both sides see the same book, which is what makes
/// `sum(active holds) <= on hand` hold across direct sales too.
#[derive(Debug, Default)]
pub struct HoldBook {
    active: Mutex<HashMap<ReservationId, Reservation>>,
}

impl HoldBook {
    /// Total held quantity for a pair, ignoring `exempt` when given (a
    /// reservation consuming itself must not count against its own sale).
    pub fn held_excluding(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        exempt: Option<ReservationId>,
    ) -> i64 {
        self.lock()
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.key == key && Some(r.id) != exempt)
            .map(|r| r.qty)
            .sum()
    }

    /// Total held quantity for a pair.
    pub fn held(&self, tenant_id: TenantId, key: StockKey) -> i64 {
        self.held_excluding(tenant_id, key, None)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReservationId, Reservation>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn held_in(
    active: &HashMap<ReservationId, Reservation>,
    tenant_id: TenantId,
    key: StockKey,
) -> i64 {
    active
        .values()
        .filter(|r| r.tenant_id == tenant_id && r.key == key)
        .map(|r| r.qty)
        .sum()
}

#[derive(Debug, Error)]
pub enum ReservationError {
    /// Not enough unreserved stock: availability = on hand minus active holds.
    #[error("insufficient availability for {key}: requested {requested}, available {available}")]
    InsufficientAvailability {
        key: StockKey,
        requested: i64,
        available: i64,
    },

    #[error("invalid reservation quantity: {0}")]
    InvalidQuantity(String),

    /// Committing an unknown (already released/committed/expired) hold.
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    /// The sale batch produced by `commit` failed to apply.
    #[error("reservation commit failed: {0}")]
    Submit(#[from] SubmitError),
}

/// Handle to a running reservation sweeper thread.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Owns reservation lifecycle: create, release, expire, convert to a sale.
///
/// Holds live in the coordinator's [`HoldBook`], so every commit path sees
/// them. The sweep only releases strictly its own expired entries; it never
/// takes the coordinator's pair locks, so it cannot deadlock with in-flight
/// commits.
pub struct ReservationManager<L, S>
where
    L: LedgerStore,
    S: TenantStore<StockKey, StockLevel>,
{
    coordinator: Arc<BatchCoordinator<L, S>>,
    holds: Arc<HoldBook>,
}

impl<L, S> ReservationManager<L, S>
where
    L: LedgerStore,
    S: TenantStore<StockKey, StockLevel>,
{
    pub fn new(coordinator: Arc<BatchCoordinator<L, S>>) -> Self {
        let holds = coordinator.holds().clone();
        Self { coordinator, holds }
    }

    /// Unreserved quantity for one pair.
    pub fn availability(&self, tenant_id: TenantId, key: StockKey) -> i64 {
        self.coordinator.projection().current_quantity(tenant_id, key)
            - self.holds.held(tenant_id, key)
    }

    /// Place a hold on `qty` units for `ttl`.
    ///
    /// Runs under the pair's coordinator lock plus the hold-book lock: the
    /// pair lock serializes the check against in-flight commits, the book
    /// lock against sibling reserves, so the total held can never exceed the
    /// on-hand quantity.
    pub fn reserve(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        qty: i64,
        actor_id: ActorId,
        ttl: Duration,
    ) -> Result<ReservationId, ReservationError> {
        if qty <= 0 {
            return Err(ReservationError::InvalidQuantity(format!(
                "qty must be positive, got {qty}"
            )));
        }

        let pair = self.coordinator.pair_lock(tenant_id, key);
        let _guard = pair.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut active = self.holds.lock();

        let on_hand = self.coordinator.projection().current_quantity(tenant_id, key);
        let available = on_hand - held_in(&active, tenant_id, key);
        if qty > available {
            return Err(ReservationError::InsufficientAvailability {
                key,
                requested: qty,
                available,
            });
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            tenant_id,
            key,
            qty,
            actor_id,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        let id = reservation.id;
        active.insert(id, reservation);
        debug!(reservation_id = %id, key = %key, qty, "reservation placed");
        Ok(id)
    }

    /// Release a hold. Releasing an already-released, committed or expired
    /// reservation is a no-op, not an error.
    pub fn release(&self, id: ReservationId) {
        if self.holds.lock().remove(&id).is_some() {
            debug!(reservation_id = %id, "reservation released");
        }
    }

    /// Convert a hold into a committed sale through the coordinator.
    ///
    /// The hold stays in place while the sale batch runs, exempted from its
    /// own availability check, and is released only once the batch commits.
    /// On failure the hold is kept until released or swept.
    pub fn commit(
        &self,
        id: ReservationId,
        reference_no: impl Into<String>,
    ) -> Result<BatchReceipt, ReservationError> {
        let reservation = self
            .holds
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ReservationError::NotFound(id))?;

        let mut batch = self.coordinator.begin_batch(
            reservation.tenant_id,
            ReferenceDoc::Sale {
                reference_no: reference_no.into(),
            },
            reservation.actor_id,
        );
        batch
            .add_line(reservation.key, -reservation.qty, MovementKind::Sale, false)
            .map_err(SubmitError::InvalidState)?;

        match self.coordinator.submit_exempting(&mut batch, Some(id)) {
            Ok(receipt) => {
                self.release(id);
                Ok(receipt)
            }
            Err(err) => {
                // Leave no half-open batch behind; the hold survives for a
                // later retry or the sweep.
                if !batch.is_terminal() {
                    let _ = self.coordinator.abort(&mut batch);
                }
                Err(ReservationError::Submit(err))
            }
        }
    }

    /// Release every expired hold and drop abandoned pending appends.
    /// Returns how many holds were released.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<ReservationId> = {
            let mut active = self.holds.lock();
            let expired: Vec<ReservationId> = active
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id)
                .collect();
            for id in &expired {
                active.remove(id);
            }
            expired
        };

        if !expired.is_empty() {
            info!(released = expired.len(), "reservation sweep released expired holds");
        }

        self.coordinator.expire_pending(PENDING_APPEND_TTL);
        expired.len()
    }

    /// Number of active holds (post-sweep bookkeeping, tests).
    pub fn active_count(&self) -> usize {
        self.holds.lock().len()
    }

    /// Run the sweep on a fixed interval in a background thread.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle
    where
        L: 'static,
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let manager = Arc::clone(self);

        let join = thread::Builder::new()
            .name("reservation-sweeper".to_string())
            .spawn(move || {
                info!("reservation sweeper started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            manager.sweep();
                        }
                    }
                }
                info!("reservation sweeper stopped");
            })
            .expect("failed to spawn reservation sweeper thread");

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
