use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use multipos_core::{ActorId, BatchId, DomainError, DomainResult, ProductId, TenantId, WarehouseId};

use crate::movement::{MovementKind, ReferenceDoc, StockKey, StockMovement};

/// Batch lifecycle. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Validating,
    Committed,
    RolledBack,
}

/// One line item of a batch: a single candidate movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLine {
    pub line_index: u32,
    pub key: StockKey,
    /// Signed quantity change: positive = inbound, negative = outbound.
    pub delta: i64,
    pub kind: MovementKind,
    pub admin_override: bool,
}

/// A sale, purchase, transfer or return: an ordered set of line items that
/// commit or roll back together.
///
/// Lines accumulate while the batch is `Open`; submission moves it through
/// `Validating` into one of the terminal states. The batch id doubles as the
/// idempotency scope for every movement it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementBatch {
    id: BatchId,
    tenant_id: TenantId,
    reference: ReferenceDoc,
    actor_id: ActorId,
    state: BatchState,
    lines: Vec<BatchLine>,
}

impl MovementBatch {
    /// Open a new batch for one business document.
    pub fn begin(tenant_id: TenantId, reference: ReferenceDoc, actor_id: ActorId) -> Self {
        Self {
            id: BatchId::new(),
            tenant_id,
            reference,
            actor_id,
            state: BatchState::Open,
            lines: Vec::new(),
        }
    }

    /// Rebuild a batch with a fixed id (idempotent caller retries).
    pub fn begin_with_id(
        id: BatchId,
        tenant_id: TenantId,
        reference: ReferenceDoc,
        actor_id: ActorId,
    ) -> Self {
        Self {
            id,
            tenant_id,
            reference,
            actor_id,
            state: BatchState::Open,
            lines: Vec::new(),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn reference(&self) -> &ReferenceDoc {
        &self.reference
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn lines(&self) -> &[BatchLine] {
        &self.lines
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BatchState::Committed | BatchState::RolledBack)
    }

    /// Add a line item. Only allowed while the batch is `Open`.
    pub fn add_line(
        &mut self,
        key: StockKey,
        delta: i64,
        kind: MovementKind,
        admin_override: bool,
    ) -> DomainResult<u32> {
        self.ensure_state(BatchState::Open, "add line")?;
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        let line_index = self.lines.len() as u32;
        self.lines.push(BatchLine {
            line_index,
            key,
            delta,
            kind,
            admin_override,
        });
        Ok(line_index)
    }

    /// Add a paired transfer (out of `from`, into `to`) for one product.
    pub fn add_transfer(
        &mut self,
        product_id: ProductId,
        from: WarehouseId,
        to: WarehouseId,
        qty: i64,
    ) -> DomainResult<()> {
        if qty <= 0 {
            return Err(DomainError::validation("transfer qty must be positive"));
        }
        if from == to {
            return Err(DomainError::validation(
                "transfer source and destination must differ",
            ));
        }

        self.add_line(
            StockKey::new(product_id, from),
            -qty,
            MovementKind::TransferOut,
            false,
        )?;
        self.add_line(
            StockKey::new(product_id, to),
            qty,
            MovementKind::TransferIn,
            false,
        )?;
        Ok(())
    }

    /// `Open -> Validating`. The coordinator calls this when submission starts.
    pub fn begin_validation(&mut self) -> DomainResult<()> {
        self.ensure_state(BatchState::Open, "submit")?;
        if self.lines.is_empty() {
            return Err(DomainError::validation("cannot submit batch without lines"));
        }
        self.state = BatchState::Validating;
        Ok(())
    }

    /// `Validating -> Committed` (terminal).
    pub fn mark_committed(&mut self) -> DomainResult<()> {
        self.ensure_state(BatchState::Validating, "commit")?;
        self.state = BatchState::Committed;
        Ok(())
    }

    /// `Open | Validating -> RolledBack` (terminal). Aborting a batch that
    /// never touched the ledger is always allowed before commit.
    pub fn mark_rolled_back(&mut self) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot roll back batch in terminal state {:?}",
                self.state
            )));
        }
        self.state = BatchState::RolledBack;
        Ok(())
    }

    /// Materialize the line items as movement records, stamped with the
    /// batch's idempotency scope.
    pub fn movements(&self, occurred_at: DateTime<Utc>) -> Vec<StockMovement> {
        self.lines
            .iter()
            .map(|line| StockMovement {
                tenant_id: self.tenant_id,
                key: line.key,
                delta: line.delta,
                kind: line.kind,
                reference: self.reference.clone(),
                batch_id: self.id,
                line_index: line.line_index,
                actor_id: self.actor_id,
                occurred_at,
                admin_override: line.admin_override,
            })
            .collect()
    }

    fn ensure_state(&self, expected: BatchState, action: &str) -> DomainResult<()> {
        if self.state != expected {
            return Err(DomainError::invariant(format!(
                "cannot {action} in state {:?} (expected {expected:?})",
                self.state
            )));
        }
        Ok(())
    }
}
