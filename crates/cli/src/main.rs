use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hotdeal_common::{CACHE_SHOP_KEY, CACHE_SHOP_TTL, ORDER_ID_PREFIX, POLL_BLOCK};
use hotdeal_core::{
    CacheClient, CacheConfig, IdGenerator, MemoryRepository, OrderWorker, PurchaseOutcome,
    Rejection, SeckillCoordinator, SeckillVoucher, UserContext, WorkerConfig, decompose,
};
use hotdeal_storage::Db;

#[derive(Parser, Debug)]
#[command(name = "hotdeal", about = "hotdeal: cache e controle de concorrência para flash sales")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simula uma flash sale: compras concorrentes + worker de pedidos
    FlashSale {
        #[arg(long, default_value_t = 1)]
        voucher: i64,
        #[arg(long, default_value_t = 100)]
        stock: i64,
        #[arg(long, default_value_t = 500)]
        users: i64,
        /// Tasks disparando compras em paralelo
        #[arg(long, default_value_t = 8)]
        concurrency: i64,
        /// Espera máxima de cada leitura do worker, em ms
        #[arg(long, default_value_t = POLL_BLOCK.as_millis() as u64)]
        poll_block_ms: u64,
    },
    /// Gera ids globais
    Ids {
        #[arg(long, default_value = ORDER_ID_PREFIX)]
        prefix: String,
        #[arg(long, short, default_value_t = 5)]
        count: usize,
    },
    /// Demonstra as estratégias do cache sobre um catálogo de lojas
    Cache {
        #[arg(long, default_value_t = 3)]
        shops: i64,
        /// Expiração lógica usada na demo, em ms
        #[arg(long, default_value_t = 200)]
        logical_ttl_ms: u64,
        #[arg(long, default_value_t = 3)]
        rebuild_workers: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shop {
    id: i64,
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hotdeal_cli=info,hotdeal_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let db = Db::new();

    match args.command {
        Command::FlashSale {
            voucher,
            stock,
            users,
            concurrency,
            poll_block_ms,
        } => flash_sale(db, voucher, stock, users, concurrency, poll_block_ms).await,
        Command::Ids { prefix, count } => ids(db, &prefix, count),
        Command::Cache {
            shops,
            logical_ttl_ms,
            rebuild_workers,
        } => cache_demo(db, shops, Duration::from_millis(logical_ttl_ms), rebuild_workers).await,
    }
}

async fn flash_sale(
    db: Db,
    voucher_id: i64,
    stock: i64,
    users: i64,
    concurrency: i64,
    poll_block_ms: u64,
) -> anyhow::Result<()> {
    let repo = MemoryRepository::new();
    let seckill = SeckillCoordinator::new(db.clone(), Arc::new(repo.clone()));
    seckill
        .register_voucher(&SeckillVoucher { voucher_id, stock })
        .await?;

    let config = WorkerConfig::default().with_poll_block(Duration::from_millis(poll_block_ms));
    let worker = OrderWorker::with_config(db, Arc::new(repo.clone()), config).spawn()?;

    let started = Instant::now();
    let concurrency = concurrency.max(1);
    let mut handles = Vec::new();
    for task in 0..concurrency {
        let seckill = seckill.clone();
        handles.push(tokio::spawn(async move {
            let mut tally = [0usize; 3];
            // Usuários distribuídos entre as tasks; cada um tenta duas vezes
            for user in (1..=users).filter(|u| u % concurrency == task) {
                let ctx = UserContext::new(user);
                for _ in 0..2 {
                    match seckill.attempt_purchase(&ctx, voucher_id)? {
                        PurchaseOutcome::Accepted { .. } => tally[0] += 1,
                        PurchaseOutcome::Rejected(Rejection::NoStock) => tally[1] += 1,
                        PurchaseOutcome::Rejected(Rejection::Duplicate) => tally[2] += 1,
                    }
                }
            }
            anyhow::Ok(tally)
        }));
    }

    let mut totals = [0usize; 3];
    for h in handles {
        let tally = h.await??;
        for (total, n) in totals.iter_mut().zip(tally) {
            *total += n;
        }
    }
    let [accepted, no_stock, duplicate] = totals;
    info!(
        "compras em {:?}: {accepted} aceitas, {no_stock} sem estoque, {duplicate} duplicadas",
        started.elapsed()
    );

    // Espera o worker materializar tudo que foi aceito
    let deadline = Instant::now() + Duration::from_secs(30);
    while repo.order_count() < accepted && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.shutdown().await;

    let persisted = repo.order_count();
    if persisted != accepted {
        warn!("{persisted} pedidos gravados para {accepted} compras aceitas");
    }
    println!("voucher:            {voucher_id}");
    println!("estoque inicial:    {stock}");
    println!("aceitas:            {accepted}");
    println!("sem estoque:        {no_stock}");
    println!("duplicadas:         {duplicate}");
    println!("estoque no store:   {}", seckill.remaining_stock(voucher_id)?);
    println!("pedidos gravados:   {persisted}");
    Ok(())
}

fn ids(db: Db, prefix: &str, count: usize) -> anyhow::Result<()> {
    let generator = IdGenerator::new(db);
    for _ in 0..count {
        let id = generator.next_id(prefix)?;
        let (seconds, counter) = decompose(id);
        println!("{id}\tsegundos={seconds}\tcontador={counter}");
    }
    Ok(())
}

async fn cache_demo(
    db: Db,
    shops: i64,
    logical_ttl: Duration,
    rebuild_workers: usize,
) -> anyhow::Result<()> {
    let catalog: Arc<HashMap<i64, Shop>> = Arc::new(
        (1..=shops)
            .map(|id| {
                (
                    id,
                    Shop {
                        id,
                        name: format!("Loja {id}"),
                    },
                )
            })
            .collect(),
    );
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = |catalog: Arc<HashMap<i64, Shop>>, loads: Arc<AtomicUsize>| {
        move |id: i64| async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(catalog.get(&id).cloned())
        }
    };

    let cache = CacheClient::with_config(
        db,
        CacheConfig::default().with_rebuild_workers(rebuild_workers),
    );

    // Pass-through: id existente e inexistente, três leituras cada
    for id in [1, shops + 1] {
        for _ in 0..3 {
            let shop: Option<Shop> = cache
                .query_with_pass_through(
                    CACHE_SHOP_KEY,
                    id,
                    loader(catalog.clone(), loads.clone()),
                    CACHE_SHOP_TTL,
                )
                .await?;
            info!("pass-through {id}: {:?}", shop.map(|s| s.name));
        }
    }
    println!("pass-through: {} consultas ao banco", loads.swap(0, Ordering::SeqCst));

    // Expiração lógica: aquece, deixa expirar, lê durante o rebuild
    let key_prefix = "cache:shop:hot:";
    for id in 1..=shops {
        cache
            .warm_up(key_prefix, id, loader(catalog.clone(), loads.clone()), logical_ttl)
            .await?;
    }
    loads.store(0, Ordering::SeqCst);
    tokio::time::sleep(logical_ttl + Duration::from_millis(10)).await;

    for _ in 0..5 {
        let shop: Option<Shop> = cache
            .query_with_logical_expire(
                key_prefix,
                1,
                loader(catalog.clone(), loads.clone()),
                logical_ttl,
            )
            .await?;
        info!("expiração lógica 1: {:?}", shop.map(|s| s.name));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("expiração lógica: {} rebuilds", loads.load(Ordering::SeqCst));
    Ok(())
}
