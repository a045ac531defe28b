//! Storage layer for execution records, responses and workspaces.

mod compress;
mod models;
mod pool;
mod sqlite;
mod store;
mod writer;

pub use compress::{decode_payload, encode_payload, DEFAULT_COMPRESS_THRESHOLD};
pub use models::*;
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use sqlite::SqliteStorage;
pub use store::{ExecutionStore, FlowRepository, ResponseStore};
pub use writer::{DurableWriter, DEFAULT_PERSIST_DEADLINE, RETRY_DELAYS_MS};
