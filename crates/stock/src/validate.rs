//! Movement validation: non-negative stock, sign discipline, transfer pairing.
//!
//! Validation is pure: callers supply the projected quantities; nothing here
//! touches the ledger.

use std::collections::HashMap;

use thiserror::Error;

use multipos_core::ProductId;

use crate::batch::BatchLine;
use crate::movement::{MovementKind, StockKey};

/// Deterministic reasons a movement (or a whole batch) is rejected.
///
/// Validation failures are surfaced to the caller and never retried
/// automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Applying the movement would drive the snapshot below zero.
    #[error("insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: StockKey,
        requested: i64,
        available: i64,
    },

    /// Transfer lines are malformed (same source/destination, unpaired rows).
    #[error("invalid warehouse transfer: {0}")]
    InvalidWarehouseTransfer(String),

    /// The delta is zero or has the wrong sign for the movement kind.
    #[error("invalid quantity delta: {0}")]
    NegativeQuantityDelta(String),
}

/// A batch-level rejection: which line failed and why.
///
/// `line_index` is `None` for structural failures that are not attributable
/// to a single line (e.g. an unpaired transfer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRejection {
    pub line_index: Option<u32>,
    pub error: ValidationError,
}

impl BatchRejection {
    fn at(line_index: u32, error: ValidationError) -> Self {
        Self {
            line_index: Some(line_index),
            error,
        }
    }

    fn structural(error: ValidationError) -> Self {
        Self {
            line_index: None,
            error,
        }
    }
}

/// Validate a single candidate movement against the projected quantity the
/// pair would have just before this movement applies.
///
/// Rejects any movement whose application would drive the snapshot below
/// zero, unless the kind is an adjustment with administrative override.
pub fn validate_movement(
    kind: MovementKind,
    delta: i64,
    admin_override: bool,
    key: StockKey,
    projected_before: i64,
) -> Result<(), ValidationError> {
    if delta == 0 {
        return Err(ValidationError::NegativeQuantityDelta(
            "delta cannot be zero".to_string(),
        ));
    }
    if kind.is_inbound() && delta < 0 {
        return Err(ValidationError::NegativeQuantityDelta(format!(
            "{} requires a positive delta, got {delta}",
            kind.as_str()
        )));
    }
    if kind.is_outbound() && delta > 0 {
        return Err(ValidationError::NegativeQuantityDelta(format!(
            "{} requires a negative delta, got {delta}",
            kind.as_str()
        )));
    }

    let after = projected_before + delta;
    if after < 0 {
        let overridden = kind == MovementKind::Adjustment && admin_override;
        if !overridden {
            return Err(ValidationError::InsufficientStock {
                key,
                requested: -delta,
                available: projected_before,
            });
        }
    }

    Ok(())
}

/// Validate a whole batch against a base snapshot.
///
/// Each line is checked against the base quantity for its pair plus the
/// running effect of prior lines in the same batch, so a batch can sell
/// units added earlier in the batch by a purchase line. All lines must pass;
/// the first failure rejects the batch.
pub fn validate_batch(
    lines: &[BatchLine],
    base_quantities: &HashMap<StockKey, i64>,
) -> Result<(), BatchRejection> {
    check_transfer_pairing(lines)?;

    let mut running: HashMap<StockKey, i64> = HashMap::new();
    for line in lines {
        let before =
            base_quantities.get(&line.key).copied().unwrap_or(0) + running.get(&line.key).copied().unwrap_or(0);

        validate_movement(line.kind, line.delta, line.admin_override, line.key, before)
            .map_err(|e| BatchRejection::at(line.line_index, e))?;

        *running.entry(line.key).or_insert(0) += line.delta;
    }

    Ok(())
}

/// Transfers must move stock between two distinct warehouses, and every
/// transfer-out quantity must be matched by transfer-in rows for the same
/// product within the batch.
fn check_transfer_pairing(lines: &[BatchLine]) -> Result<(), BatchRejection> {
    let mut out_qty: HashMap<ProductId, i64> = HashMap::new();
    let mut in_qty: HashMap<ProductId, i64> = HashMap::new();
    let mut out_warehouses: HashMap<ProductId, Vec<StockKey>> = HashMap::new();

    for line in lines {
        match line.kind {
            MovementKind::TransferOut => {
                *out_qty.entry(line.key.product_id).or_insert(0) += -line.delta;
                out_warehouses
                    .entry(line.key.product_id)
                    .or_default()
                    .push(line.key);
            }
            MovementKind::TransferIn => {
                *in_qty.entry(line.key.product_id).or_insert(0) += line.delta;
            }
            _ => {}
        }
    }

    for line in lines {
        if line.kind != MovementKind::TransferIn {
            continue;
        }
        let sources = out_warehouses.get(&line.key.product_id);
        if sources
            .map(|keys| keys.iter().any(|k| k.warehouse_id == line.key.warehouse_id))
            .unwrap_or(false)
        {
            return Err(BatchRejection::at(
                line.line_index,
                ValidationError::InvalidWarehouseTransfer(format!(
                    "source and destination warehouse are identical for product {}",
                    line.key.product_id
                )),
            ));
        }
    }

    for (product_id, qty_out) in &out_qty {
        let qty_in = in_qty.get(product_id).copied().unwrap_or(0);
        if *qty_out != qty_in {
            return Err(BatchRejection::structural(
                ValidationError::InvalidWarehouseTransfer(format!(
                    "unbalanced transfer for product {product_id}: out {qty_out}, in {qty_in}"
                )),
            ));
        }
    }
    for (product_id, qty_in) in &in_qty {
        if !out_qty.contains_key(product_id) {
            return Err(BatchRejection::structural(
                ValidationError::InvalidWarehouseTransfer(format!(
                    "transfer-in without transfer-out for product {product_id} ({qty_in} units)"
                )),
            ));
        }
    }

    Ok(())
}
