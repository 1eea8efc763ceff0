#![forbid(unsafe_code)]

mod cache;
mod id;
mod lock;
mod model;
mod rebuild;
mod repository;
mod seckill;
mod worker;

pub use cache::{CacheClient, CacheConfig, LogicalEntry};
pub use id::{IdGenerator, decompose};
pub use lock::{DistributedLock, LockClient, LockGuard};
pub use model::{SeckillIntent, SeckillVoucher, UserContext, VoucherOrder};
pub use rebuild::{RebuildJob, RebuildPool};
pub use repository::{MemoryRepository, OrderRepository};
pub use seckill::{PurchaseOutcome, Rejection, SeckillCoordinator};
pub use worker::{Materialization, OrderWorker, WorkerConfig, WorkerHandle};
