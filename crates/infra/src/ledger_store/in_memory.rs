use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use multipos_core::{ExpectedVersion, MovementId, TenantId};
use multipos_stock::{IdempotencyKey, StockKey, StockMovement};

use super::r#trait::{AppendReport, CommittedMovement, LedgerStore, LedgerStoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    key: StockKey,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<CommittedMovement>>,
    /// Idempotency index: every committed `(tenant, batch, line)` maps to
    /// the movement it produced.
    index: HashMap<(TenantId, IdempotencyKey), MovementId>,
}

/// In-memory append-only ledger store.
///
/// Intended for tests/dev and as the reference semantics for durable
/// backends. The single inner lock is what makes a batch append atomic to
/// concurrent readers.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    inner: RwLock<Inner>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[CommittedMovement]) -> u64 {
        stream.last().map(|m| m.sequence_number).unwrap_or(0)
    }

    fn commit_into(inner: &mut Inner, movement: StockMovement, now: DateTime<Utc>) -> CommittedMovement {
        let stream_key = StreamKey {
            tenant_id: movement.tenant_id,
            key: movement.key,
        };
        let idem = (movement.tenant_id, movement.idempotency_key());

        let stream = inner.streams.entry(stream_key).or_default();
        let committed = CommittedMovement {
            movement_id: MovementId::new(),
            sequence_number: Self::current_version(stream) + 1,
            committed_at: now,
            movement,
        };
        stream.push(committed.clone());
        inner.index.insert(idem, committed.movement_id);
        committed
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append_batch(
        &self,
        movements: Vec<StockMovement>,
        expected: ExpectedVersion,
    ) -> Result<AppendReport, LedgerStoreError> {
        if movements.is_empty() {
            return Err(LedgerStoreError::Invalid("empty batch".to_string()));
        }

        // All movements must belong to the same tenant.
        let tenant_id = movements[0].tenant_id;
        for (idx, m) in movements.iter().enumerate() {
            if m.tenant_id != tenant_id {
                return Err(LedgerStoreError::TenantIsolation(format!(
                    "batch contains multiple tenant_ids (index {idx})"
                )));
            }
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|_| LedgerStoreError::Invalid("lock poisoned".to_string()))?;

        // The version expectation covers every stream the batch touches,
        // checked before anything is written.
        let mut checked: Vec<StreamKey> = Vec::new();
        for m in &movements {
            let stream_key = StreamKey {
                tenant_id,
                key: m.key,
            };
            if checked.contains(&stream_key) {
                continue;
            }
            checked.push(stream_key);

            let current = inner
                .streams
                .get(&stream_key)
                .map(|s| Self::current_version(s))
                .unwrap_or(0);
            if !expected.matches(current) {
                return Err(LedgerStoreError::Concurrency(format!(
                    "expected {expected:?}, found {current} for {}",
                    m.key
                )));
            }
        }

        // All appends in the batch share one commit instant and happen under
        // one write-lock section, so readers see the set or nothing.
        let now = Utc::now();
        let mut report = AppendReport::default();

        for movement in movements {
            let idem = (tenant_id, movement.idempotency_key());
            if inner.index.contains_key(&idem) {
                report.already_applied.push(movement.idempotency_key());
                continue;
            }
            report.committed.push(Self::commit_into(&mut inner, movement, now));
        }

        Ok(report)
    }

    fn list_movements(
        &self,
        tenant_id: TenantId,
        key: StockKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommittedMovement>, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Invalid("lock poisoned".to_string()))?;

        let stream = inner
            .streams
            .get(&StreamKey { tenant_id, key })
            .cloned()
            .unwrap_or_default();

        Ok(match since {
            None => stream,
            Some(cutoff) => stream
                .into_iter()
                .filter(|m| m.committed_at >= cutoff)
                .collect(),
        })
    }

    fn stream_version(
        &self,
        tenant_id: TenantId,
        key: StockKey,
    ) -> Result<u64, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Invalid("lock poisoned".to_string()))?;

        Ok(inner
            .streams
            .get(&StreamKey { tenant_id, key })
            .map(|s| Self::current_version(s))
            .unwrap_or(0))
    }
}
