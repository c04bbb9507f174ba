//! Infrastructure layer: ledger storage, projections, coordination, reservations.

pub mod coordinator;
pub mod ledger_store;
pub mod projection;
pub mod read_model;
pub mod reservations;


pub use coordinator::{BatchCoordinator, BatchReceipt, SubmitError};
pub use ledger_store::{
    AppendReport, CommittedMovement, InMemoryLedgerStore, LedgerStore, LedgerStoreError,
};
pub use projection::{ConsistencyError, ProjectionError, StockLevel, StockLevelProjection};
pub use read_model::{InMemoryTenantStore, TenantStore};
pub use reservations::{HoldBook, Reservation, ReservationError, ReservationManager, SweeperHandle};
