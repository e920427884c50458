// ABOUTME: Bounded blocking connection pool with idle-connection eviction
// ABOUTME: Borrowed connections return to the pool when dropped

use anyhow::{bail, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{Connector, RowSource, SourceConnection, TableDescription};
use crate::types::Statement;

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of open connections
    pub max_size: usize,
    /// Idle connections older than this are closed on the next checkout
    pub idle_timeout: Duration,
    /// How long `get` blocks on an exhausted pool. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            idle_timeout: Duration::from_secs(600), // 10 minutes
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

struct IdleConnection {
    conn: Box<dyn SourceConnection>,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    total: usize,
    closed: bool,
}

/// Blocking, bounded pool of source connections.
///
/// `get` hands out an idle connection when one exists, opens a new one while
/// under `max_size`, and otherwise blocks until a connection is returned.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrow a connection, blocking while the pool is exhausted.
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            if state.closed {
                bail!("Connection pool is closed");
            }
            let expired = Self::take_expired(&mut state, self.config.idle_timeout);
            if !expired.is_empty() {
                tracing::debug!(
                    "Closing {} idle {} connection(s)",
                    expired.len(),
                    self.connector.name()
                );
                // Close outside the lock, then look at the pool again.
                drop(state);
                drop(expired);
                state = self.lock();
                continue;
            }

            if let Some(idle) = state.idle.pop() {
                return Ok(PooledConnection::new(idle.conn, Arc::clone(self)));
            }

            if state.total < self.config.max_size {
                state.total += 1;
                drop(state);
                return match self.connector.connect() {
                    Ok(conn) => {
                        tracing::debug!("Opened new {} connection", self.connector.name());
                        Ok(PooledConnection::new(conn, Arc::clone(self)))
                    }
                    Err(e) => {
                        let mut state = self.lock();
                        state.total -= 1;
                        self.returned.notify_one();
                        Err(e)
                    }
                };
            }

            tracing::debug!(
                "Connection pool exhausted ({} open), waiting for a connection",
                state.total
            );
            state = match self.config.acquire_timeout {
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        bail!(
                            "Timed out after {:?} waiting for a database connection",
                            timeout
                        );
                    }
                    let (guard, _) = self
                        .returned
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    guard
                }
                None => self
                    .returned
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    fn take_expired(state: &mut PoolState, idle_timeout: Duration) -> Vec<IdleConnection> {
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|idle| now.duration_since(idle.returned_at) >= idle_timeout);
        state.idle = kept;
        state.total -= expired.len();
        expired
    }

    /// Close idle connections that outlived the idle timeout.
    pub fn evict_idle(&self) -> usize {
        let expired = {
            let mut state = self.lock();
            Self::take_expired(&mut state, self.config.idle_timeout)
        };
        expired.len()
    }

    fn release(&self, conn: Box<dyn SourceConnection>) {
        let mut state = self.lock();
        if state.closed {
            state.total -= 1;
            drop(state);
            drop(conn);
            return;
        }
        state.idle.push(IdleConnection {
            conn,
            returned_at: Instant::now(),
        });
        drop(state);
        self.returned.notify_one();
    }

    fn discard(&self, conn: Box<dyn SourceConnection>) {
        drop(conn);
        self.lock().total -= 1;
        self.returned.notify_one();
    }

    /// Number of open connections, borrowed or idle.
    pub fn size(&self) -> usize {
        self.lock().total
    }

    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    /// Close idle connections and refuse further checkouts. Borrowed
    /// connections are closed as they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.total -= idle.len();
            idle
        };
        drop(idle);
        self.returned.notify_all();
    }
}

/// Stand-in left behind once a borrowed connection went back to its pool.
struct Returned;

impl SourceConnection for Returned {
    fn describe_table(
        &mut self,
        _schema: Option<&str>,
        _table: &str,
    ) -> Result<Option<TableDescription>> {
        bail!("Connection was already returned to the pool")
    }

    fn query(&mut self, _statement: &Statement) -> Result<Box<dyn RowSource>> {
        bail!("Connection was already returned to the pool")
    }
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Box<dyn SourceConnection>,
    pool: Option<Arc<ConnectionPool>>,
}

impl PooledConnection {
    fn new(conn: Box<dyn SourceConnection>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            conn,
            pool: Some(pool),
        }
    }

    /// Give the connection back to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(pool) = self.pool.take() {
            let conn = std::mem::replace(&mut self.conn, Box::new(Returned));
            pool.release(conn);
        }
    }

    /// Close the connection instead of returning it, for a connection a
    /// failed read may have left mid-statement. Frees its pool slot.
    pub fn discard(&mut self) {
        if let Some(pool) = self.pool.take() {
            let conn = std::mem::replace(&mut self.conn, Box::new(Returned));
            pool.discard(conn);
        }
    }

    pub fn is_released(&self) -> bool {
        self.pool.is_none()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn SourceConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BufferedRows;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::thread;

    struct FakeConnection;

    impl SourceConnection for FakeConnection {
        fn describe_table(
            &mut self,
            _schema: Option<&str>,
            _table: &str,
        ) -> Result<Option<TableDescription>> {
            Ok(None)
        }

        fn query(&mut self, _statement: &Statement) -> Result<Box<dyn RowSource>> {
            Ok(Box::new(BufferedRows::default()))
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
        fail: AtomicBool,
    }

    impl Connector for CountingConnector {
        fn connect(&self) -> Result<Box<dyn SourceConnection>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("refused"));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// Records whether the pool lock was free when the connection closed.
    struct LockObservingConnection {
        pool: Arc<OnceLock<Weak<ConnectionPool>>>,
        closed_unlocked: Arc<AtomicBool>,
    }

    impl SourceConnection for LockObservingConnection {
        fn describe_table(
            &mut self,
            _schema: Option<&str>,
            _table: &str,
        ) -> Result<Option<TableDescription>> {
            Ok(None)
        }

        fn query(&mut self, _statement: &Statement) -> Result<Box<dyn RowSource>> {
            Ok(Box::new(BufferedRows::default()))
        }
    }

    impl Drop for LockObservingConnection {
        fn drop(&mut self) {
            if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
                let unlocked = pool.state.try_lock().is_ok();
                self.closed_unlocked.store(unlocked, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct LockObservingConnector {
        pool: Arc<OnceLock<Weak<ConnectionPool>>>,
        closed_unlocked: Arc<AtomicBool>,
    }

    impl Connector for LockObservingConnector {
        fn connect(&self) -> Result<Box<dyn SourceConnection>> {
            Ok(Box::new(LockObservingConnection {
                pool: Arc::clone(&self.pool),
                closed_unlocked: Arc::clone(&self.closed_unlocked),
            }))
        }

        fn name(&self) -> &'static str {
            "observed"
        }
    }

    #[test]
    fn test_connections_are_reused() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());

        let conn = pool.get().unwrap();
        drop(conn);
        let _conn = pool.get().unwrap();

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = ConnectionPool::new(
            Arc::new(CountingConnector::default()),
            PoolConfig::default(),
        );
        let mut conn = pool.get().unwrap();
        conn.release();
        conn.release();
        assert!(conn.is_released());
        assert!(conn.query(&Statement { sql: "SELECT 1".into(), params: vec![] }).is_err());
        drop(conn);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let config = PoolConfig::default()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::new(Arc::new(CountingConnector::default()), config);
        let _held = pool.get().unwrap();
        let err = pool.get().err().unwrap();
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_exhausted_pool_blocks_until_return() {
        let config = PoolConfig::default().with_max_size(1);
        let pool = ConnectionPool::new(Arc::new(CountingConnector::default()), config);
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get().map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_idle_connections_expire() {
        let connector = Arc::new(CountingConnector::default());
        let config = PoolConfig::default().with_idle_timeout(Duration::from_millis(0));
        let pool = ConnectionPool::new(connector.clone(), config);
        drop(pool.get().unwrap());
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.size(), 0);

        drop(pool.get().unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_connections_close_outside_lock() {
        let connector = Arc::new(LockObservingConnector::default());
        let config = PoolConfig::default().with_idle_timeout(Duration::from_millis(0));
        let pool = ConnectionPool::new(connector.clone(), config);
        let _ = connector.pool.set(Arc::downgrade(&pool));

        drop(pool.get().unwrap());
        let _conn = pool.get().unwrap();
        assert!(connector.closed_unlocked.load(Ordering::SeqCst));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_discarded_connection_is_not_reused() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default().with_max_size(1));
        let mut conn = pool.get().unwrap();
        conn.discard();
        assert!(conn.is_released());
        drop(conn);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle(), 0);

        let _conn = pool.get().unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_discard_wakes_waiting_checkout() {
        let config = PoolConfig::default().with_max_size(1);
        let pool = ConnectionPool::new(Arc::new(CountingConnector::default()), config);
        let mut held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get().map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        held.discard();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_failed_connect_frees_slot() {
        let connector = Arc::new(CountingConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default().with_max_size(1));
        assert!(pool.get().is_err());
        assert_eq!(pool.size(), 0);

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_closed_pool_refuses_checkout() {
        let pool = ConnectionPool::new(
            Arc::new(CountingConnector::default()),
            PoolConfig::default(),
        );
        let conn = pool.get().unwrap();
        pool.close();
        assert!(pool.get().is_err());
        drop(conn);
        assert_eq!(pool.size(), 0);
    }
}
