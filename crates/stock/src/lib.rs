//! `multipos-stock` — stock movement domain model.
//!
//! Movements are immutable facts; the ledger of committed movements is the
//! source of truth for on-hand quantities. Batches group movements that must
//! commit or roll back together.

pub mod batch;
pub mod movement;
pub mod validate;

pub use batch::{BatchLine, BatchState, MovementBatch};
pub use movement::{
    DocumentKind, IdempotencyKey, MovementKind, ReferenceDoc, StockKey, StockMovement,
};
pub use validate::{validate_batch, validate_movement, BatchRejection, ValidationError};
