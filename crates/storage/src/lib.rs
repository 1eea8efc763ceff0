#![forbid(unsafe_code)]

mod db;
mod entry;
mod keyspace;
mod options;
pub mod script;
mod stream;
mod zset;

pub use db::Db;
pub use keyspace::Keyspace;
pub use options::{KeyTtl, SetCondition, SetOptions};
pub use script::Script;
pub use stream::{ReadFrom, StreamEntry, StreamId};
