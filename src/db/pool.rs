//! Bounded connection pool for the embedded analytical engine.
//!
//! Handles are created lazily up to a maximum; waiters queue FIFO behind a
//! fair semaphore; acquisition is timeout-bounded and a timeout is reported
//! as a distinct error kind, never silently retried. A background probe
//! sweeps idle handles with a trivial query and replaces any that fail.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use duckdb::{AccessMode, Connection};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DatabaseConfig;
use crate::error::PoolError;

/// One engine handle with pool bookkeeping.
pub struct Handle {
    pub id: u64,
    pub conn: Connection,
    pub created_at: Instant,
}

struct PoolState {
    idle: VecDeque<Handle>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: DatabaseConfig,
    state: Mutex<PoolState>,
    /// Fair semaphore: permits = max pool size, waiters served FIFO.
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    waiting: AtomicUsize,
    replaced: AtomicU64,
}

/// Pool health snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub unhealthy_replaced: u64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open the pool and eagerly create the minimum number of handles.
    pub async fn open(config: DatabaseConfig) -> Result<Self, PoolError> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.pool_max)),
                config: config.clone(),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
                waiting: AtomicUsize::new(0),
                replaced: AtomicU64::new(0),
            }),
        };
        // The first open also validates the database path.
        for _ in 0..pool.inner.config.pool_min.max(1) {
            let handle = pool.create_handle().await?;
            let mut state = pool.inner.state.lock().expect("pool lock poisoned");
            state.total += 1;
            state.idle.push_back(handle);
        }
        Ok(pool)
    }

    fn open_connection(config: &DatabaseConfig) -> Result<Connection, PoolError> {
        let engine_config = duckdb::Config::default()
            .access_mode(AccessMode::ReadWrite)
            .map_err(|e| PoolError::Open(e.to_string()))?
            .max_memory(&config.memory_limit)
            .map_err(|e| PoolError::Open(e.to_string()))?
            .threads(config.threads as i64)
            .map_err(|e| PoolError::Open(e.to_string()))?;
        Connection::open_with_flags(&config.path, engine_config)
            .map_err(|e| PoolError::Open(format!("{}: {e}", config.path.display())))
    }

    async fn create_handle(&self) -> Result<Handle, PoolError> {
        let config = self.inner.config.clone();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = tokio::task::spawn_blocking(move || Self::open_connection(&config))
            .await
            .map_err(|e| PoolError::Open(e.to_string()))??;
        Ok(Handle {
            id,
            conn,
            created_at: Instant::now(),
        })
    }

    /// Acquire a handle, waiting at most the configured acquisition timeout.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let timeout = self.inner.config.acquire_timeout;
        self.inner.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await;
        self.inner.waiting.fetch_sub(1, Ordering::Relaxed);

        let permit = match permit {
            Err(_) => return Err(PoolError::Timeout { waited: timeout }),
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };

        // Under a permit: reuse an idle handle or create a new one.
        let existing = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.idle.pop_front()
        };

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let handle = self.create_handle().await?;
                let mut state = self.inner.state.lock().expect("pool lock poisoned");
                state.total += 1;
                handle
            }
        };

        Ok(PooledConnection {
            handle: Some(handle),
            broken: false,
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    pub fn health(&self) -> PoolHealth {
        let state = self.inner.state.lock().expect("pool lock poisoned");
        PoolHealth {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total - state.idle.len(),
            waiting: self.inner.waiting.load(Ordering::Relaxed),
            unhealthy_replaced: self.inner.replaced.load(Ordering::Relaxed),
        }
    }

    /// Probe idle handles with a trivial query, dropping any that fail, and
    /// top the pool back up to its minimum.
    pub async fn sweep(&self) {
        let candidates: Vec<Handle> = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.idle.drain(..).collect()
        };

        let mut kept = Vec::with_capacity(candidates.len());
        for handle in candidates {
            let checked = tokio::task::spawn_blocking(move || {
                let ok = handle
                    .conn
                    .query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                    .is_ok();
                (handle, ok)
            })
            .await;
            match checked {
                Ok((handle, true)) => kept.push(handle),
                Ok((handle, false)) => {
                    tracing::warn!(handle_id = handle.id, "idle handle failed probe, replacing");
                    let mut state = self.inner.state.lock().expect("pool lock poisoned");
                    state.total -= 1;
                    self.inner.replaced.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!("health probe task failed: {e}");
                    let mut state = self.inner.state.lock().expect("pool lock poisoned");
                    state.total -= 1;
                    self.inner.replaced.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            for handle in kept {
                state.idle.push_back(handle);
            }
        }

        // Top up to the minimum after replacements.
        loop {
            {
                let state = self.inner.state.lock().expect("pool lock poisoned");
                if state.closed || state.total >= self.inner.config.pool_min {
                    break;
                }
            }
            match self.create_handle().await {
                Ok(handle) => {
                    let mut state = self.inner.state.lock().expect("pool lock poisoned");
                    state.total += 1;
                    state.idle.push_back(handle);
                }
                Err(e) => {
                    tracing::error!("failed to replace unhealthy handle: {e}");
                    break;
                }
            }
        }
    }

    /// Spawn the periodic health sweeper.
    pub fn spawn_health_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = self.inner.config.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.sweep().await;
            }
        })
    }

    /// Shut the pool down; subsequent acquisitions fail with `Closed`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        state.closed = true;
        let dropped = state.idle.len();
        state.idle.clear();
        state.total -= dropped;
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let health = self.health();
        f.debug_struct("ConnectionPool")
            .field("total", &health.total)
            .field("idle", &health.idle)
            .finish()
    }
}

/// A checked-out handle. Dropping returns it to the pool; a handle marked
/// broken (or taken and never given back) is destroyed and counted for
/// replacement instead.
pub struct PooledConnection {
    handle: Option<Handle>,
    broken: bool,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("handle_id", &self.handle.as_ref().map(|h| h.id))
            .field("broken", &self.broken)
            .finish()
    }
}

impl PooledConnection {
    /// Take the raw handle to move it into a blocking task.
    ///
    /// The caller must `give_back` the handle afterwards; if it never comes
    /// back (timeout abandoned the task), the drop path treats the slot as
    /// broken and the pool replaces it.
    pub fn take(&mut self) -> Option<Handle> {
        self.handle.take()
    }

    pub fn give_back(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    /// Flag the underlying handle as unusable.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn handle_id(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.id)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        match self.handle.take() {
            Some(handle) if !self.broken && !state.closed => {
                state.idle.push_back(handle);
            }
            _ => {
                // Broken, abandoned in a blocking task, or pool closed.
                state.total = state.total.saturating_sub(1);
                self.inner.replaced.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Create the database file with an empty schema if it does not exist.
///
/// Test and doctor helper; the production file comes from the loader.
pub fn ensure_database_file(path: &Path) -> Result<(), PoolError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| PoolError::Open(e.to_string()))?;
    }
    let conn = Connection::open(path)?;
    drop(conn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(path: &Path, min: usize, max: usize) -> DatabaseConfig {
        DatabaseConfig {
            path: path.to_path_buf(),
            pool_min: min,
            pool_max: max,
            acquire_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_secs(5),
            memory_limit: "512MB".to_string(),
            threads: 2,
            health_interval: Duration::from_secs(60),
        }
    }

    async fn open_pool(min: usize, max: usize) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.duckdb");
        ensure_database_file(&path).expect("database file");
        let pool = ConnectionPool::open(test_config(&path, min, max))
            .await
            .expect("pool opens");
        (dir, pool)
    }

    #[tokio::test]
    async fn opens_minimum_handles() {
        let (_dir, pool) = open_pool(2, 4).await;
        let health = pool.health();
        assert_eq!(health.total, 2);
        assert_eq!(health.idle, 2);
        assert_eq!(health.in_use, 0);
    }

    #[tokio::test]
    async fn acquire_reuses_and_grows_to_max() {
        let (_dir, pool) = open_pool(1, 2).await;

        let a = pool.acquire().await.expect("first");
        let b = pool.acquire().await.expect("second grows pool");
        assert_eq!(pool.health().total, 2);
        assert_eq!(pool.health().in_use, 2);

        drop(a);
        drop(b);
        assert_eq!(pool.health().idle, 2);
    }

    #[tokio::test]
    async fn acquisition_times_out_distinctly() {
        let (_dir, pool) = open_pool(1, 1).await;
        let _held = pool.acquire().await.expect("hold the only handle");

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn broken_handles_are_replaced_not_reused() {
        let (_dir, pool) = open_pool(1, 2).await;

        let mut conn = pool.acquire().await.expect("acquire");
        let id = conn.handle_id();
        conn.mark_broken();
        drop(conn);

        let health = pool.health();
        assert_eq!(health.total, 0);
        assert_eq!(health.unhealthy_replaced, 1);

        // The next acquisition creates a fresh handle.
        let conn = pool.acquire().await.expect("fresh handle");
        assert_ne!(conn.handle_id(), id);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_never_exceed_max() {
        let (_dir, pool) = open_pool(1, 3).await;

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.expect("acquire");
                let in_use = pool.health().in_use;
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(conn);
                in_use
            }));
        }
        for task in tasks {
            let observed = task.await.expect("task");
            assert!(observed <= 3, "observed {observed} handles in use");
        }
    }

    #[tokio::test]
    async fn sweep_keeps_healthy_idle_handles() {
        let (_dir, pool) = open_pool(2, 4).await;
        pool.sweep().await;
        let health = pool.health();
        assert_eq!(health.total, 2);
        assert_eq!(health.unhealthy_replaced, 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquisition() {
        let (_dir, pool) = open_pool(1, 2).await;
        pool.close();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Closed | PoolError::Timeout { .. }));
    }
}
