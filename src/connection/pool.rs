//! Connection pooling with health checks, idle eviction, and establish
//! retry.
//!
//! Connections are cached under `host:port:user` keys. A leased connection
//! is marked `in_use` until released; a background ticker evicts entries
//! idle past the TTL and pings the rest. One coarse async mutex guards the
//! map; command execution never happens under it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{create_connection, Connection, ConnectionError, ConnectionInfo, ConnectionResult};

/// A pooled connection behind its lease mutex.
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// Factory building unconnected transport variants; replaceable for tests.
pub type ConnectionFactory =
    Box<dyn Fn(&ConnectionInfo) -> Box<dyn Connection> + Send + Sync>;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on total pooled connections
    pub max_connections: usize,
    /// Idle TTL before eviction
    pub max_idle_time: Duration,
    /// Bound on a single connect attempt
    pub connection_timeout: Duration,
    /// Background health ticker period
    pub health_check_interval: Duration,
    /// Connect attempts before giving up
    pub retry_attempts: u32,
    /// Sleep between connect attempts
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Bookkeeping wrapper around one pooled connection.
struct PooledEntry {
    connection: SharedConnection,
    info: ConnectionInfo,
    last_used: Instant,
    in_use: bool,
    health_check_at: Instant,
    created_at: Instant,
    use_count: u64,
}

impl PooledEntry {
    fn new(connection: SharedConnection, info: ConnectionInfo) -> Self {
        let now = Instant::now();
        Self {
            connection,
            info,
            last_used: now,
            in_use: true,
            health_check_at: now,
            created_at: now,
            use_count: 1,
        }
    }
}

/// A leased connection. Hand it back with [`ConnectionPool::release`].
pub struct PooledConnection {
    /// The connection; lock it to execute
    pub connection: SharedConnection,
    /// Info the connection was established with
    pub info: ConnectionInfo,
    /// Times this connection has been leased
    pub use_count: u64,
    key: String,
}

impl PooledConnection {
    /// Pool key this lease came from.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("info", &self.info)
            .field("use_count", &self.use_count)
            .field("key", &self.key)
            .finish()
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total pooled connections
    pub total: usize,
    /// Currently leased
    pub in_use: usize,
    /// Idle and reusable
    pub idle: usize,
}

/// Keyed cache of live connections.
pub struct ConnectionPool {
    entries: Arc<Mutex<HashMap<String, Vec<PooledEntry>>>>,
    config: PoolConfig,
    factory: Arc<ConnectionFactory>,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    /// Create a pool with default tuning.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with explicit tuning.
    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_factory(config, Box::new(|info| create_connection(info)))
    }

    /// Create a pool with a custom transport factory.
    pub fn with_factory(config: PoolConfig, factory: ConnectionFactory) -> Self {
        let pool = Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            config,
            factory: Arc::new(factory),
            shutdown: CancellationToken::new(),
        };
        pool.spawn_health_ticker();
        pool
    }

    fn spawn_health_ticker(&self) {
        let entries = Arc::clone(&self.entries);
        let interval = self.config.health_check_interval;
        let max_idle = self.config.max_idle_time;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                // Collect idle candidates due for a check; ping outside the
                // map lock.
                let now = Instant::now();
                let mut stale: Vec<(String, SharedConnection)> = Vec::new();
                let mut to_ping: Vec<(String, SharedConnection)> = Vec::new();
                {
                    let mut map = entries.lock().await;
                    for (key, list) in map.iter_mut() {
                        list.retain_mut(|entry| {
                            if entry.in_use {
                                return true;
                            }
                            if now.duration_since(entry.health_check_at) < interval {
                                return true;
                            }
                            if now.duration_since(entry.last_used) > max_idle {
                                trace!(key = %key, "evicting idle connection");
                                stale.push((key.clone(), Arc::clone(&entry.connection)));
                                return false;
                            }
                            entry.health_check_at = now;
                            to_ping.push((key.clone(), Arc::clone(&entry.connection)));
                            true
                        });
                    }
                }

                for (key, connection) in stale {
                    let mut conn = connection.lock().await;
                    let _ = conn.close().await;
                    debug!(key = %key, "closed idle-expired connection");
                }

                for (key, connection) in to_ping {
                    let healthy = {
                        let conn = connection.lock().await;
                        conn.ping().await.is_ok()
                    };
                    if !healthy {
                        warn!(key = %key, "health check failed, evicting");
                        let mut map = entries.lock().await;
                        if let Some(list) = map.get_mut(&key) {
                            list.retain(|e| !Arc::ptr_eq(&e.connection, &connection));
                        }
                        drop(map);
                        let mut conn = connection.lock().await;
                        let _ = conn.close().await;
                    }
                }
            }
        });
    }

    /// Lease a connection for `info`, reusing a live idle entry when one
    /// exists, else establishing a new one (with retries).
    pub async fn get(
        &self,
        ctx: &CancellationToken,
        info: &ConnectionInfo,
    ) -> ConnectionResult<PooledConnection> {
        let key = info.pool_key();

        // Phase 1 (under lock): reuse, evict stale, reserve capacity.
        let mut evicted: Vec<SharedConnection> = Vec::new();
        let reuse = {
            let mut map = self.entries.lock().await;
            let now = Instant::now();

            let mut found = None;
            if let Some(list) = map.get_mut(&key) {
                let max_idle = self.config.max_idle_time;
                list.retain_mut(|entry| {
                    if found.is_some() || entry.in_use {
                        return true;
                    }
                    if now.duration_since(entry.last_used) > max_idle {
                        evicted.push(Arc::clone(&entry.connection));
                        return false;
                    }
                    let alive = entry
                        .connection
                        .try_lock()
                        .map(|c| c.is_connected())
                        .unwrap_or(false);
                    if !alive {
                        evicted.push(Arc::clone(&entry.connection));
                        return false;
                    }
                    entry.in_use = true;
                    entry.last_used = now;
                    entry.use_count += 1;
                    found = Some(PooledConnection {
                        connection: Arc::clone(&entry.connection),
                        info: entry.info.clone(),
                        use_count: entry.use_count,
                        key: key.clone(),
                    });
                    true
                });
            }

            if found.is_none() {
                // Reserve capacity for a new connection.
                let total: usize = map.values().map(Vec::len).sum();
                if total >= self.config.max_connections {
                    let mut oldest: Option<(String, Instant)> = None;
                    for (k, list) in map.iter() {
                        for entry in list.iter().filter(|e| !e.in_use) {
                            if oldest.as_ref().map(|(_, t)| entry.last_used < *t).unwrap_or(true) {
                                oldest = Some((k.clone(), entry.last_used));
                            }
                        }
                    }
                    match oldest {
                        Some((victim_key, victim_time)) => {
                            if let Some(list) = map.get_mut(&victim_key) {
                                if let Some(pos) = list
                                    .iter()
                                    .position(|e| !e.in_use && e.last_used == victim_time)
                                {
                                    let entry = list.remove(pos);
                                    evicted.push(entry.connection);
                                    debug!(key = %victim_key, "evicted oldest idle connection");
                                }
                            }
                        }
                        None => return Err(ConnectionError::PoolExhausted),
                    }
                }
            }
            found
        };

        for connection in evicted {
            let mut conn = connection.lock().await;
            let _ = conn.close().await;
        }

        if let Some(lease) = reuse {
            trace!(key = %lease.key, use_count = lease.use_count, "reusing pooled connection");
            return Ok(lease);
        }

        // Phase 2 (no lock): establish with retry.
        let connection = self.establish(ctx, info).await?;
        let shared: SharedConnection = Arc::new(Mutex::new(connection));

        let lease = {
            let mut map = self.entries.lock().await;
            let entry = PooledEntry::new(Arc::clone(&shared), info.clone());
            let lease = PooledConnection {
                connection: Arc::clone(&shared),
                info: info.clone(),
                use_count: entry.use_count,
                key: key.clone(),
            };
            map.entry(key.clone()).or_default().push(entry);
            lease
        };
        debug!(key = %key, "established new pooled connection");
        Ok(lease)
    }

    async fn establish(
        &self,
        ctx: &CancellationToken,
        info: &ConnectionInfo,
    ) -> ConnectionResult<Box<dyn Connection>> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = ConnectionError::ConnectionFailed {
            host: info.host.clone(),
            message: "no attempt made".into(),
        };

        for attempt in 1..=attempts {
            if ctx.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }
            let mut connection = (self.factory)(info);
            let connect = connection.connect(info.clone());
            let bounded = tokio::time::timeout(self.config.connection_timeout, connect);

            let outcome = tokio::select! {
                _ = ctx.cancelled() => return Err(ConnectionError::Cancelled),
                outcome = bounded => outcome,
            };

            match outcome {
                Ok(Ok(())) => return Ok(connection),
                Ok(Err(e)) => {
                    warn!(host = %info.host, attempt, error = %e, "connect attempt failed");
                    last_error = e;
                }
                Err(_) => {
                    let seconds = self.config.connection_timeout.as_secs();
                    warn!(host = %info.host, attempt, seconds, "connect attempt timed out");
                    last_error = ConnectionError::Timeout {
                        host: info.host.clone(),
                        seconds,
                    };
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(ConnectionError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }
        Err(last_error)
    }

    /// Return a leased connection to the pool.
    pub async fn release(&self, lease: PooledConnection) {
        let mut map = self.entries.lock().await;
        if let Some(list) = map.get_mut(lease.key()) {
            for entry in list.iter_mut() {
                if Arc::ptr_eq(&entry.connection, &lease.connection) {
                    entry.in_use = false;
                    entry.last_used = Instant::now();
                    trace!(key = %lease.key, "released connection");
                    return;
                }
            }
        }
        // The entry was evicted while leased; close it outside the map.
        drop(map);
        let mut conn = lease.connection.lock().await;
        let _ = conn.close().await;
    }

    /// Snapshot of pool occupancy.
    pub async fn stats(&self) -> PoolStats {
        let map = self.entries.lock().await;
        let mut stats = PoolStats::default();
        for list in map.values() {
            for entry in list {
                stats.total += 1;
                if entry.in_use {
                    stats.in_use += 1;
                } else {
                    stats.idle += 1;
                }
            }
        }
        stats
    }

    /// Stop the health ticker and close every pooled connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let drained: Vec<SharedConnection> = {
            let mut map = self.entries.lock().await;
            map.drain()
                .flat_map(|(_, list)| list.into_iter().map(|e| e.connection))
                .collect()
        };
        for connection in drained {
            let mut conn = connection.lock().await;
            let _ = conn.close().await;
        }
        debug!("connection pool closed");
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        CommandResult, EventStream, ExecuteOptions, FetchReader, StreamEvent, STREAM_BUFFER,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncRead;
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct MockState {
        created: Arc<AtomicUsize>,
        connect_failures: Arc<AtomicUsize>,
        ping_fails: Arc<AtomicBool>,
    }

    struct MockConnection {
        state: MockState,
        connected: AtomicBool,
        host: String,
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn host(&self) -> String {
            self.host.clone()
        }

        async fn connect(&mut self, info: ConnectionInfo) -> ConnectionResult<()> {
            if self.state.connect_failures.load(Ordering::SeqCst) > 0 {
                self.state.connect_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ConnectionError::ConnectionFailed {
                    host: info.host,
                    message: "synthetic failure".into(),
                });
            }
            self.host = info.host;
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _command: &str,
            _options: &ExecuteOptions,
        ) -> ConnectionResult<CommandResult> {
            Ok(CommandResult::success("mock".into(), String::new()))
        }

        async fn execute_stream(
            &self,
            _command: &str,
            _options: &ExecuteOptions,
        ) -> ConnectionResult<EventStream> {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            let _ = tx
                .send(StreamEvent::done(CommandResult::success(
                    String::new(),
                    String::new(),
                )))
                .await;
            Ok(rx)
        }

        async fn copy(
            &self,
            _src: &mut (dyn AsyncRead + Send + Unpin),
            _dest: &str,
            _mode: u32,
        ) -> ConnectionResult<()> {
            Ok(())
        }

        async fn fetch(&self, _src: &str) -> ConnectionResult<FetchReader> {
            Ok(Box::new(std::io::Cursor::new(Vec::new())))
        }

        async fn close(&mut self) -> ConnectionResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn ping(&self) -> ConnectionResult<()> {
            if self.state.ping_fails.load(Ordering::SeqCst) {
                Err(ConnectionError::ExecutionFailed {
                    host: self.host.clone(),
                    message: "ping failed".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn mock_pool(config: PoolConfig, state: MockState) -> ConnectionPool {
        ConnectionPool::with_factory(
            config,
            Box::new(move |_info| {
                state.created.fetch_add(1, Ordering::SeqCst);
                Box::new(MockConnection {
                    state: state.clone(),
                    connected: AtomicBool::new(false),
                    host: String::new(),
                })
            }),
        )
    }

    fn info(host: &str) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(host);
        info.user = "deploy".into();
        info
    }

    #[tokio::test]
    async fn test_get_release_reuses_connection() {
        let state = MockState::default();
        let pool = mock_pool(PoolConfig::default(), state.clone());
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        assert_eq!(lease.use_count, 1);
        assert_eq!(pool.stats().await.in_use, 1);
        pool.release(lease).await;
        assert_eq!(pool.stats().await.idle, 1);

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        assert_eq!(lease.use_count, 2);
        assert_eq!(state.created.load(Ordering::SeqCst), 1);
        pool.release(lease).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_leased_connection_not_shared() {
        let state = MockState::default();
        let pool = mock_pool(PoolConfig::default(), state.clone());
        let ctx = CancellationToken::new();

        let a = pool.get(&ctx, &info("web01")).await.unwrap();
        let b = pool.get(&ctx, &info("web01")).await.unwrap();
        assert!(!Arc::ptr_eq(&a.connection, &b.connection));
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        pool.release(a).await;
        pool.release(b).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_leased_connection_is_connected() {
        let state = MockState::default();
        let pool = mock_pool(PoolConfig::default(), state);
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        assert!(lease.connection.lock().await.is_connected());
        pool.release(lease).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_all_leased() {
        let state = MockState::default();
        let config = PoolConfig {
            max_connections: 1,
            ..Default::default()
        };
        let pool = mock_pool(config, state);
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        let err = pool.get(&ctx, &info("web02")).await.unwrap_err();
        assert!(matches!(err, ConnectionError::PoolExhausted));
        pool.release(lease).await;

        // With the lease back, capacity can be reclaimed.
        let lease = pool.get(&ctx, &info("web02")).await.unwrap();
        pool.release(lease).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_establish_retries() {
        let state = MockState::default();
        state.connect_failures.store(2, Ordering::SeqCst);
        let config = PoolConfig {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let pool = mock_pool(config, state.clone());
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("flaky")).await.unwrap();
        // Two failed factories plus the successful one.
        assert_eq!(state.created.load(Ordering::SeqCst), 3);
        pool.release(lease).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_establish_gives_up_after_retries() {
        let state = MockState::default();
        state.connect_failures.store(10, Ordering::SeqCst);
        let config = PoolConfig {
            retry_attempts: 2,
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let pool = mock_pool(config, state);
        let ctx = CancellationToken::new();

        let err = pool.get(&ctx, &info("down")).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_get() {
        let state = MockState::default();
        state.connect_failures.store(10, Ordering::SeqCst);
        let config = PoolConfig {
            retry_attempts: 5,
            retry_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let pool = mock_pool(config, state);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = pool.get(&ctx, &info("web01")).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_creates_fresh_connection() {
        let state = MockState::default();
        let config = PoolConfig {
            max_idle_time: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let pool = mock_pool(config, state.clone());
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        pool.release(lease).await;
        assert_eq!(pool.stats().await.total, 1);

        // Let the idle TTL elapse and the health ticker fire.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        assert_eq!(lease.use_count, 1);
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        pool.release(lease).await;
        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_evicts() {
        let state = MockState::default();
        let config = PoolConfig {
            max_idle_time: Duration::from_secs(3600),
            health_check_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let pool = mock_pool(config, state.clone());
        let ctx = CancellationToken::new();

        let lease = pool.get(&ctx, &info("web01")).await.unwrap();
        pool.release(lease).await;

        state.ping_fails.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(pool.stats().await.total, 0);
        pool.close().await;
    }
}
