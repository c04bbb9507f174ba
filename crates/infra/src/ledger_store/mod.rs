//! Append-only stock ledger boundary.
//!
//! This module defines an infrastructure-facing abstraction for storing and
//! reading tenant-scoped movement streams without making any storage
//! assumptions. Streams are keyed by `(tenant, product, warehouse)`.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use r#trait::{AppendReport, CommittedMovement, LedgerStore, LedgerStoreError};
