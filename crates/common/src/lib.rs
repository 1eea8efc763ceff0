#![forbid(unsafe_code)]

mod error;

pub use error::*;

use std::time::Duration;

// --- Prefixos de chave ---

pub const LOCK_KEY_PREFIX: &str = "lock:";
pub const LOCK_ORDER_PREFIX: &str = "order:";
pub const ID_KEY_PREFIX: &str = "icr:";
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";
pub const CACHE_SHOP_KEY: &str = "cache:shop:";

// --- Cache ---

pub const CACHE_NULL_TTL: Duration = Duration::from_secs(2 * 60);
pub const CACHE_SHOP_TTL: Duration = Duration::from_secs(30 * 60);
pub const LOCK_CACHE_LEASE: Duration = Duration::from_secs(10);
pub const REBUILD_WORKERS: usize = 3;
pub const REBUILD_QUEUE_CAPACITY: usize = 256;
pub const MUTEX_RETRY_INTERVAL: Duration = Duration::from_millis(50);
pub const MUTEX_MAX_RETRIES: usize = 100;

// --- Gerador de ids ---

/// 2022-01-01T00:00:00Z em segundos.
pub const BEGIN_TIMESTAMP: i64 = 1_640_995_200;
pub const COUNT_BITS: u32 = 32;
pub const ORDER_ID_PREFIX: &str = "order";

// --- Pipeline de pedidos ---

pub const ORDER_STREAM: &str = "stream.orders";
pub const ORDER_GROUP: &str = "g1";
pub const ORDER_CONSUMER: &str = "c1";
pub const ORDER_LOCK_LEASE: Duration = Duration::from_secs(30);
pub const POLL_BLOCK: Duration = Duration::from_secs(2);
pub const RECOVERY_BACKOFF: Duration = Duration::from_secs(1);
