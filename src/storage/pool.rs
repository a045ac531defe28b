//! r2d2 pool behind [`super::SqliteStorage`].
//!
//! File databases run in WAL mode with a busy timeout so concurrent upserts
//! and cleanup deletes queue on each other. Contention that outlasts the
//! busy timeout, or a pool that stays exhausted past `connection_timeout`,
//! surfaces as a transient error for the durable writer to retry.

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: u32,
    /// How long `get` waits for a free connection.
    pub connection_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for PoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            connection_timeout: Duration::from_secs(config.connection_timeout_secs),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

fn file_pragmas(busy_timeout: Duration) -> String {
    format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = {};
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
        busy_timeout.as_millis()
    )
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    pub fn new(path: &Path, config: PoolConfig) -> Result<Self> {
        let pragmas = file_pragmas(config.busy_timeout);
        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| conn.execute_batch(&pragmas));
        Self::build(manager, config.pool_size, config.connection_timeout)
    }

    /// Single-connection pool over a private in-memory database. Every
    /// in-memory connection is a separate database, so callers share one.
    pub fn new_in_memory(config: PoolConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        Self::build(manager, 1, config.connection_timeout)
    }

    fn build(manager: SqliteConnectionManager, size: u32, timeout: Duration) -> Result<Self> {
        let inner = Pool::builder()
            .max_size(size)
            .connection_timeout(timeout)
            .build(manager)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { inner })
    }

    /// Check out a connection. Exhaustion is reported as transient.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.inner
            .get()
            .map_err(|e| Error::TransientStorage(format!("connection pool busy: {}", e)))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Run `f` on a pooled connection off the async runtime.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_connection_mut(move |conn| f(conn)).await
    }

    /// Like [`Self::with_connection`], for callers that open transactions.
    pub async fn with_connection_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("storage task panicked: {}", e)))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_config_from_storage_section() {
        let storage = StorageConfig {
            pool_size: 0,
            busy_timeout_ms: 250,
            ..StorageConfig::default()
        };
        let config = PoolConfig::from(&storage);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_file_connections_use_wal_and_busy_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            busy_timeout: Duration::from_millis(750),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(&dir.path().join("busy.db"), config).unwrap();

        let (busy, journal): (i64, String) = pool
            .with_connection(|conn| {
                let busy = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
                let journal = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                Ok((busy, journal))
            })
            .await
            .unwrap();
        assert_eq!(busy, 750);
        assert_eq!(journal.to_lowercase(), "wal");
    }

    #[test]
    fn test_exhausted_pool_is_transient() {
        let config = PoolConfig {
            connection_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new_in_memory(config).unwrap();
        let held = pool.get().unwrap();

        let err = pool.get().err().unwrap();
        assert!(err.is_transient_lock());
        drop(held);
        assert!(pool.get().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_writers_share_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            pool_size: 4,
            ..PoolConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(&dir.path().join("c.db"), config).unwrap());
        pool.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE hits (n INTEGER NOT NULL); INSERT INTO hits (n) VALUES (0);",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.with_connection(|conn| {
                    conn.execute("UPDATE hits SET n = n + 1", [])?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let hits: i64 = pool
            .with_connection(|conn| Ok(conn.query_row("SELECT n FROM hits", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(hits, 10);
        assert!(pool.stats().connections <= 4);
    }
}
