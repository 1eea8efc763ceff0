use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::time::Duration;

use hotdeal_common::{ORDER_CONSUMER, ORDER_GROUP, ORDER_STREAM, RepositoryError};
use hotdeal_core::{
    MemoryRepository, OrderRepository, OrderWorker, PurchaseOutcome, Rejection, SeckillCoordinator,
    SeckillIntent, SeckillVoucher, UserContext, VoucherOrder, WorkerConfig,
};
use hotdeal_storage::{Db, ReadFrom};

const VOUCHER: i64 = 10;

fn worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_block(Duration::from_millis(50))
        .with_recovery_backoff(Duration::from_millis(20))
}

async fn setup(stock: i64) -> (Db, MemoryRepository, SeckillCoordinator) {
    let db = Db::new();
    let repo = MemoryRepository::new();
    let seckill = SeckillCoordinator::new(db.clone(), Arc::new(repo.clone()));
    seckill
        .register_voucher(&SeckillVoucher {
            voucher_id: VOUCHER,
            stock,
        })
        .await
        .unwrap();
    (db, repo, seckill)
}

/// Espera até `cond` valer ou estoura o tempo.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout esperando condição");
}

#[tokio::test]
async fn test_concurrent_purchases_respect_stock() {
    let (db, repo, seckill) = setup(10).await;
    let worker = OrderWorker::with_config(db.clone(), Arc::new(repo.clone()), worker_config())
        .spawn()
        .unwrap();

    let mut handles = Vec::new();
    for user in 1..=40 {
        let seckill = seckill.clone();
        handles.push(tokio::spawn(async move {
            let ctx = UserContext::new(user);
            let first = seckill.attempt_purchase(&ctx, VOUCHER).unwrap();
            let second = seckill.attempt_purchase(&ctx, VOUCHER).unwrap();
            // Segunda tentativa nunca é aceita
            assert!(second.order_id().is_none());
            first
        }));
    }

    let mut accepted = 0;
    for h in handles {
        if let PurchaseOutcome::Accepted { .. } = h.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 10);

    wait_until(|| repo.order_count() == 10).await;
    let orders = repo.orders_for_voucher(VOUCHER);
    let users: HashSet<i64> = orders.iter().map(|o| o.user_id).collect();
    assert_eq!(users.len(), 10);
    assert_eq!(repo.get_voucher(VOUCHER).await.unwrap().unwrap().stock, 0);

    worker.shutdown().await;
    assert_eq!(db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap(), 0);
}

#[tokio::test]
async fn test_last_unit_two_buyers() {
    let (db, repo, seckill) = setup(1).await;
    let worker = OrderWorker::with_config(db, Arc::new(repo.clone()), worker_config())
        .spawn()
        .unwrap();

    let a = {
        let seckill = seckill.clone();
        tokio::spawn(async move { seckill.attempt_purchase(&UserContext::new(1), VOUCHER).unwrap() })
    };
    let b = {
        let seckill = seckill.clone();
        tokio::spawn(async move { seckill.attempt_purchase(&UserContext::new(2), VOUCHER).unwrap() })
    };
    let outcomes = [a.await.unwrap(), b.await.unwrap()];

    let winner = outcomes.iter().find_map(|o| o.order_id()).expect("um aceito");
    assert!(outcomes.contains(&PurchaseOutcome::Rejected(Rejection::NoStock)));

    wait_until(|| repo.order_count() == 1).await;
    assert_eq!(repo.orders_for_voucher(VOUCHER)[0].id, winner);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_same_user_buys_twice() {
    let (db, repo, seckill) = setup(5).await;
    let worker = OrderWorker::with_config(db, Arc::new(repo.clone()), worker_config())
        .spawn()
        .unwrap();
    let user = UserContext::new(42);

    assert!(seckill.attempt_purchase(&user, VOUCHER).unwrap().order_id().is_some());
    wait_until(|| repo.order_count() == 1).await;

    assert_eq!(
        seckill.attempt_purchase(&user, VOUCHER).unwrap(),
        PurchaseOutcome::Rejected(Rejection::Duplicate)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repo.count_orders(42, VOUCHER).await.unwrap(), 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_crash_before_ack_recovered_on_restart() {
    let (db, repo, seckill) = setup(5).await;
    let worker = OrderWorker::with_config(db.clone(), Arc::new(repo.clone()), worker_config());
    worker.ensure_group().unwrap();

    let order_id = seckill
        .attempt_purchase(&UserContext::new(7), VOUCHER)
        .unwrap()
        .order_id()
        .unwrap();

    // Worker anterior leu a entrada e caiu antes de gravar e reconhecer
    let delivered = db
        .xreadgroup(ORDER_STREAM, ORDER_GROUP, ORDER_CONSUMER, 1, ReadFrom::New)
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap(), 1);

    // Reinício: a varredura inicial encontra a pendência
    let handle = worker.spawn().unwrap();
    wait_until(|| repo.order_count() == 1).await;
    wait_until(|| db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap() == 0).await;

    let orders = repo.orders_for_voucher(VOUCHER);
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(orders[0].user_id, 7);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_intent_creates_single_order() {
    let (db, repo, seckill) = setup(5).await;
    let handle = OrderWorker::with_config(db.clone(), Arc::new(repo.clone()), worker_config())
        .spawn()
        .unwrap();

    let order_id = seckill
        .attempt_purchase(&UserContext::new(3), VOUCHER)
        .unwrap()
        .order_id()
        .unwrap();
    wait_until(|| repo.order_count() == 1).await;

    // Mesma intent publicada de novo
    let intent = SeckillIntent {
        voucher_id: VOUCHER,
        user_id: 3,
        order_id,
    };
    db.xadd(ORDER_STREAM, intent.to_fields()).unwrap();
    wait_until(|| db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(repo.count_orders(3, VOUCHER).await.unwrap(), 1);
    assert_eq!(repo.get_voucher(VOUCHER).await.unwrap().unwrap().stock, 4);

    handle.shutdown().await;
}

/// Repositório que falha as primeiras `failures` gravações de pedido.
struct FlakyRepository {
    inner: MemoryRepository,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyRepository {
    fn new(inner: MemoryRepository, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OrderRepository for FlakyRepository {
    async fn get_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>, RepositoryError> {
        self.inner.get_voucher(voucher_id).await
    }

    async fn save_voucher(&self, voucher: &SeckillVoucher) -> Result<(), RepositoryError> {
        self.inner.save_voucher(voucher).await
    }

    async fn decrement_stock(&self, voucher_id: i64) -> Result<u64, RepositoryError> {
        self.inner.decrement_stock(voucher_id).await
    }

    async fn insert_order(&self, order: &VoucherOrder) -> Result<(), RepositoryError> {
        self.inner.insert_order(order).await
    }

    async fn create_order(&self, order: &VoucherOrder) -> Result<bool, RepositoryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Unavailable("conexão recusada".into()));
        }
        self.inner.create_order(order).await
    }

    async fn count_orders(&self, user_id: i64, voucher_id: i64) -> Result<u64, RepositoryError> {
        self.inner.count_orders(user_id, voucher_id).await
    }
}

async fn flaky_setup(
    stock: i64,
    failures: usize,
) -> (Db, MemoryRepository, Arc<FlakyRepository>, SeckillCoordinator) {
    let db = Db::new();
    let inner = MemoryRepository::new();
    let repo = Arc::new(FlakyRepository::new(inner.clone(), failures));
    let seckill = SeckillCoordinator::new(db.clone(), repo.clone());
    seckill
        .register_voucher(&SeckillVoucher {
            voucher_id: VOUCHER,
            stock,
        })
        .await
        .unwrap();
    (db, inner, repo, seckill)
}

#[tokio::test]
async fn test_repository_outage_recovered_by_pending_replay() {
    let (db, inner, repo, seckill) = flaky_setup(10, 2).await;
    let handle = OrderWorker::with_config(db.clone(), repo.clone(), worker_config())
        .spawn()
        .unwrap();

    seckill
        .attempt_purchase(&UserContext::new(11), VOUCHER)
        .unwrap();

    wait_until(|| inner.order_count() == 1).await;
    wait_until(|| db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap() == 0).await;
    // Uma falha no loop principal, uma na recuperação, depois sucesso
    assert_eq!(repo.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(inner.count_orders(11, VOUCHER).await.unwrap(), 1);
    // Tentativas que falharam não consumiram estoque
    assert_eq!(inner.get_voucher(VOUCHER).await.unwrap().unwrap().stock, 9);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_last_unit_survives_failed_order_write() {
    let (db, inner, repo, seckill) = flaky_setup(1, 1).await;
    let handle = OrderWorker::with_config(db.clone(), repo.clone(), worker_config())
        .spawn()
        .unwrap();

    let order_id = seckill
        .attempt_purchase(&UserContext::new(11), VOUCHER)
        .unwrap()
        .order_id()
        .expect("compra aceita");

    wait_until(|| inner.order_count() == 1).await;
    wait_until(|| db.xpending_count(ORDER_STREAM, ORDER_GROUP).unwrap() == 0).await;

    let orders = inner.orders_for_voucher(VOUCHER);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(repo.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(inner.get_voucher(VOUCHER).await.unwrap().unwrap().stock, 0);

    handle.shutdown().await;
}
