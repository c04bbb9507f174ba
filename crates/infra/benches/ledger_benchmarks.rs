use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use multipos_core::{ActorId, BatchId, ExpectedVersion, ProductId, TenantId, WarehouseId};
use multipos_infra::{
    BatchCoordinator, InMemoryLedgerStore, InMemoryTenantStore, LedgerStore, StockLevel,
    StockLevelProjection,
};
use multipos_stock::{MovementKind, ReferenceDoc, StockKey, StockMovement};

/// Naive CRUD simulation: direct quantity updates (no ledger, no history).
#[derive(Debug, Clone)]
struct NaiveStockStore {
    inner: Arc<RwLock<HashMap<(TenantId, StockKey), i64>>>,
}

impl NaiveStockStore {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn adjust(&self, tenant_id: TenantId, key: StockKey, delta: i64) -> Result<(), ()> {
        let mut map = self.inner.write().unwrap();
        let quantity = map.entry((tenant_id, key)).or_insert(0);
        let next = *quantity + delta;
        if next < 0 {
            return Err(());
        }
        *quantity = next;
        Ok(())
    }
}

type Coordinator =
    BatchCoordinator<Arc<InMemoryLedgerStore>, Arc<InMemoryTenantStore<StockKey, StockLevel>>>;

fn setup_coordinator() -> (Coordinator, TenantId, StockKey) {
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let projection = Arc::new(StockLevelProjection::new(Arc::new(
        InMemoryTenantStore::new(),
    )));
    let coordinator = BatchCoordinator::new(ledger, projection);
    let tenant_id = TenantId::new();
    let key = StockKey::new(ProductId::new(), WarehouseId::new());
    (coordinator, tenant_id, key)
}

fn stock_up(coordinator: &Coordinator, tenant_id: TenantId, key: StockKey, qty: i64) {
    let mut batch = coordinator.begin_batch(
        tenant_id,
        ReferenceDoc::Purchase {
            reference_no: "purchase-0001".to_string(),
        },
        ActorId::new(),
    );
    batch
        .add_line(key, qty, MovementKind::Purchase, false)
        .unwrap();
    coordinator.submit(&mut batch).unwrap();
}

fn movement(
    tenant_id: TenantId,
    key: StockKey,
    delta: i64,
    batch_id: BatchId,
    line_index: u32,
) -> StockMovement {
    StockMovement {
        tenant_id,
        key,
        delta,
        kind: if delta >= 0 {
            MovementKind::Purchase
        } else {
            MovementKind::Sale
        },
        reference: ReferenceDoc::Purchase {
            reference_no: "purchase-0001".to_string(),
        },
        batch_id,
        line_index,
        actor_id: ActorId::new(),
        occurred_at: Utc::now(),
        admin_override: false,
    }
}

fn bench_batch_submit_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_submit_latency");
    group.sample_size(1000);

    // Benchmark: single-line sale against a deep stock pool
    group.bench_function("single_line_sale", |b| {
        let (coordinator, tenant_id, key) = setup_coordinator();
        stock_up(&coordinator, tenant_id, key, 1_000_000_000_000);

        b.iter(|| {
            let mut batch = coordinator.begin_batch(
                tenant_id,
                ReferenceDoc::Sale {
                    reference_no: "sale-0001".to_string(),
                },
                ActorId::new(),
            );
            batch
                .add_line(key, black_box(-1), MovementKind::Sale, false)
                .unwrap();
            coordinator.submit(&mut batch).unwrap();
        });
    });

    // Benchmark: paired transfer (two pair locks, two streams)
    group.bench_function("paired_transfer", |b| {
        let (coordinator, tenant_id, key) = setup_coordinator();
        let product = key.product_id;
        let other = WarehouseId::new();
        stock_up(&coordinator, tenant_id, key, 1_000_000_000_000);

        b.iter(|| {
            let mut batch = coordinator.begin_batch(
                tenant_id,
                ReferenceDoc::Transfer {
                    reference_no: "transfer-0001".to_string(),
                },
                ActorId::new(),
            );
            batch
                .add_transfer(product, key.warehouse_id, other, black_box(1))
                .unwrap();
            coordinator.submit(&mut batch).unwrap();
        });
    });

    group.finish();
}

fn bench_ledger_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_append_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            batch_size,
            |b, &size| {
                let store = InMemoryLedgerStore::new();
                let tenant_id = TenantId::new();
                let key = StockKey::new(ProductId::new(), WarehouseId::new());

                b.iter(|| {
                    let batch_id = BatchId::new();
                    let movements: Vec<StockMovement> = (0..size)
                        .map(|i| movement(tenant_id, key, 1, batch_id, i as u32))
                        .collect();
                    black_box(store.append_batch(movements, ExpectedVersion::Any).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for movement_count in [10, 100, 1000, 10000].iter() {
        group.bench_with_input(
            BenchmarkId::new("rebuild_from_movements", movement_count),
            movement_count,
            |b, &count| {
                let store = InMemoryLedgerStore::new();
                let tenant_id = TenantId::new();
                let key = StockKey::new(ProductId::new(), WarehouseId::new());

                for i in 0..count {
                    let delta = if i % 3 == 0 { 5 } else { -1 };
                    store
                        .append_batch(
                            vec![movement(tenant_id, key, delta, BatchId::new(), 0)],
                            ExpectedVersion::Any,
                        )
                        .unwrap();
                }

                let projection: StockLevelProjection<
                    Arc<InMemoryTenantStore<StockKey, StockLevel>>,
                > = StockLevelProjection::new(Arc::new(InMemoryTenantStore::new()));

                b.iter(|| {
                    black_box(projection.rebuild(tenant_id, key, &store).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_ledger_vs_naive_crud(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_vs_naive_crud");
    group.sample_size(1000);

    // Benchmark: full pipeline (validate + append + project)
    group.bench_function("coordinated_sale", |b| {
        let (coordinator, tenant_id, key) = setup_coordinator();
        stock_up(&coordinator, tenant_id, key, 1_000_000_000_000);

        b.iter(|| {
            let mut batch = coordinator.begin_batch(
                tenant_id,
                ReferenceDoc::Sale {
                    reference_no: "sale-0001".to_string(),
                },
                ActorId::new(),
            );
            batch.add_line(key, -1, MovementKind::Sale, false).unwrap();
            coordinator.submit(&mut batch).unwrap();
        });
    });

    // Benchmark: bare quantity update with a floor check
    group.bench_function("naive_crud_sale", |b| {
        let store = NaiveStockStore::new();
        let tenant_id = TenantId::new();
        let key = StockKey::new(ProductId::new(), WarehouseId::new());
        store.adjust(tenant_id, key, 1_000_000_000_000).unwrap();

        b.iter(|| {
            store.adjust(tenant_id, key, -1).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_batch_submit_latency,
    bench_ledger_append_throughput,
    bench_projection_rebuild_speed,
    bench_ledger_vs_naive_crud
);
criterion_main!(benches);
