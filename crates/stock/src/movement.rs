use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use multipos_core::{ActorId, BatchId, ProductId, TenantId, WarehouseId};

/// The unit of stream partitioning: one product in one warehouse.
///
/// All ordering, locking and projection guarantees are scoped to a single
/// key; keys never contend with each other.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            product_id,
            warehouse_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.product_id, self.warehouse_id)
    }
}

/// What kind of business event moved the stock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Purchase,
    Sale,
    TransferOut,
    TransferIn,
    Return,
    DisposableUse,
    Adjustment,
}

impl MovementKind {
    /// Kinds that add stock; their delta must be positive.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            MovementKind::Purchase | MovementKind::TransferIn | MovementKind::Return
        )
    }

    /// Kinds that remove stock; their delta must be negative.
    pub fn is_outbound(self) -> bool {
        matches!(
            self,
            MovementKind::Sale | MovementKind::TransferOut | MovementKind::DisposableUse
        )
    }

    /// Stable movement-type identifier (audit streams, log fields).
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Purchase => "stock.movement.purchase",
            MovementKind::Sale => "stock.movement.sale",
            MovementKind::TransferOut => "stock.movement.transfer_out",
            MovementKind::TransferIn => "stock.movement.transfer_in",
            MovementKind::Return => "stock.movement.return",
            MovementKind::DisposableUse => "stock.movement.disposable_use",
            MovementKind::Adjustment => "stock.movement.adjustment",
        }
    }
}

/// Kind discriminant of a [`ReferenceDoc`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Sale,
    Purchase,
    Transfer,
    SaleReturn,
    PurchaseReturn,
    Disposable,
    Adjustment,
}

/// The business document a movement belongs to.
///
/// Explicit tagged variant over the fixed set of owning document kinds; the
/// `reference_no` is generated and owned by the calling workflow module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceDoc {
    Sale { reference_no: String },
    Purchase { reference_no: String },
    Transfer { reference_no: String },
    SaleReturn { reference_no: String },
    PurchaseReturn { reference_no: String },
    Disposable { reference_no: String },
    Adjustment { reference_no: String },
}

impl ReferenceDoc {
    pub fn kind(&self) -> DocumentKind {
        match self {
            ReferenceDoc::Sale { .. } => DocumentKind::Sale,
            ReferenceDoc::Purchase { .. } => DocumentKind::Purchase,
            ReferenceDoc::Transfer { .. } => DocumentKind::Transfer,
            ReferenceDoc::SaleReturn { .. } => DocumentKind::SaleReturn,
            ReferenceDoc::PurchaseReturn { .. } => DocumentKind::PurchaseReturn,
            ReferenceDoc::Disposable { .. } => DocumentKind::Disposable,
            ReferenceDoc::Adjustment { .. } => DocumentKind::Adjustment,
        }
    }

    pub fn reference_no(&self) -> &str {
        match self {
            ReferenceDoc::Sale { reference_no }
            | ReferenceDoc::Purchase { reference_no }
            | ReferenceDoc::Transfer { reference_no }
            | ReferenceDoc::SaleReturn { reference_no }
            | ReferenceDoc::PurchaseReturn { reference_no }
            | ReferenceDoc::Disposable { reference_no }
            | ReferenceDoc::Adjustment { reference_no } => reference_no,
        }
    }
}

/// Deduplication key for appends: batch id + position of the line within it.
///
/// Retrying an append with the same key must not apply the movement twice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub batch_id: BatchId,
    pub line_index: u32,
}

impl IdempotencyKey {
    pub fn new(batch_id: BatchId, line_index: u32) -> Self {
        Self {
            batch_id,
            line_index,
        }
    }
}

/// An immutable stock-affecting fact.
///
/// Once committed to the ledger a movement is never mutated or deleted;
/// corrections are new offsetting movements in a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub tenant_id: TenantId,
    pub key: StockKey,
    /// Signed quantity change: positive = inbound, negative = outbound.
    pub delta: i64,
    pub kind: MovementKind,
    pub reference: ReferenceDoc,
    pub batch_id: BatchId,
    pub line_index: u32,
    pub actor_id: ActorId,
    /// Business time: when the movement occurred.
    pub occurred_at: DateTime<Utc>,
    /// Allows an adjustment to drive the snapshot below zero (stocktake
    /// write-offs). Ignored for every other kind.
    pub admin_override: bool,
}

impl StockMovement {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.batch_id, self.line_index)
    }

    /// Stable movement-type identifier (e.g. "stock.movement.sale").
    pub fn movement_type(&self) -> &'static str {
        self.kind.as_str()
    }
}
