// # Connection Pool
//
// Pooled outbound connections to other shards and to the catalog, amortizing
// socket setup for processes that contact the same hosts continuously. One
// pool-wide mutex guards per-host LIFO stacks of idle connections; the mutex
// is held only around stack manipulation, never across I/O.
//
// Correctness hinges on never reusing a half-consumed connection: the handle
// returned by `acquire` must be explicitly released, and a handle dropped
// without release closes its connection on the assumption the caller died
// mid-conversation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Result, ShardError};

/// A live outbound connection. Dropping the box closes the underlying
/// transport; `close` exists for graceful teardown paths that want to say
/// goodbye first.
#[async_trait]
pub trait Connection: Send {
    fn host(&self) -> &str;

    /// Cheap liveness probe; a `false` connection is discarded.
    async fn is_healthy(&mut self) -> bool;

    async fn close(&mut self);

    /// Escape hatch for hooks that know the concrete connection type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Establishes new connections. Injected so routers, shards, and tests can
/// share the pool with different transports.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn Connection>>;
}

/// Interceptor invoked around the pool's lifecycle events. The sharding
/// layer uses one to stamp version metadata on every handout.
pub trait PoolHook: Send + Sync {
    /// A connection was newly established.
    fn on_create(&self, conn: &mut dyn Connection);

    /// A connection is about to be handed to a caller (new or pooled).
    fn on_handed_out(&self, conn: &mut dyn Connection);

    /// A connection was returned healthy.
    fn on_release(&self, _conn: &mut dyn Connection) {}
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Soft cap per host; a healthy connection released beyond the cap is
    /// closed instead of pooled.
    pub max_per_host: usize,

    /// Idle age past which a pooled connection is probed before reuse.
    pub idle_probe_after: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_per_host: 100,
            idle_probe_after: Duration::from_secs(300),
        }
    }
}

struct IdleConn {
    conn: Box<dyn Connection>,
    pooled_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct PoolInner {
    /// Host -> LIFO stack of idle connections.
    hosts: HashMap<String, Vec<IdleConn>>,
    /// Bumped by `flush`; idle connections from older generations get a
    /// health probe before reuse.
    flush_generation: u64,
    closed: bool,
}

#[derive(Default)]
pub struct HostStats {
    pub created: AtomicU64,
    pub handed_out: AtomicU64,
    pub returned: AtomicU64,
    pub discarded: AtomicU64,
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    hooks: RwLock<Vec<Arc<dyn PoolHook>>>,
    options: PoolOptions,
    stats: DashMap<String, Arc<HostStats>>,
    /// Handed to connection handles so they can return themselves.
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, options: PoolOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            factory,
            inner: Mutex::new(PoolInner::default()),
            hooks: RwLock::new(Vec::new()),
            options,
            stats: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Install an interceptor. Hooks see every connection created or handed
    /// out after registration.
    pub fn register_hook(&self, hook: Arc<dyn PoolHook>) {
        self.hooks.write().push(hook);
    }

    pub fn max_per_host(&self) -> usize {
        self.options.max_per_host
    }

    fn host_stats(&self, host: &str) -> Arc<HostStats> {
        self.stats
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// An open, healthy connection to `host`: the most recently pooled one
    /// when available, else a freshly established one. Blocks only on
    /// socket establishment.
    pub async fn acquire(&self, host: &str) -> Result<PooledConnection> {
        let stats = self.host_stats(host);
        loop {
            let candidate = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(ShardError::PoolClosed);
                }
                let generation = inner.flush_generation;
                inner
                    .hosts
                    .get_mut(host)
                    .and_then(|stack| stack.pop())
                    .map(|idle| {
                        let needs_probe = idle.generation < generation
                            || idle.pooled_at.elapsed() > self.options.idle_probe_after;
                        (idle, needs_probe)
                    })
            };

            match candidate {
                Some((mut idle, needs_probe)) => {
                    if needs_probe && !idle.conn.is_healthy().await {
                        trace!(host, "discarding stale pooled connection");
                        stats.discarded.fetch_add(1, Ordering::Relaxed);
                        idle.conn.close().await;
                        continue;
                    }
                    stats.handed_out.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.hand_out(host, idle.conn));
                }
                None => {
                    // Stack drained; establish outside the lock.
                    let mut conn = self.factory.connect(host).await?;
                    debug!(host, "established new pooled connection");
                    stats.created.fetch_add(1, Ordering::Relaxed);
                    stats.handed_out.fetch_add(1, Ordering::Relaxed);
                    for hook in self.hooks.read().iter() {
                        hook.on_create(conn.as_mut());
                    }
                    return Ok(self.hand_out(host, conn));
                }
            }
        }
    }

    fn hand_out(&self, host: &str, mut conn: Box<dyn Connection>) -> PooledConnection {
        for hook in self.hooks.read().iter() {
            hook.on_handed_out(conn.as_mut());
        }
        PooledConnection {
            host: host.to_string(),
            conn: Some(conn),
            failed: false,
            pool: self.self_ref.clone(),
        }
    }

    /// Return a connection to its host stack, unless it was marked failed
    /// or the stack is at the per-host cap.
    fn release_conn(&self, host: &str, mut conn: Box<dyn Connection>, failed: bool) {
        let stats = self.host_stats(host);
        if failed {
            trace!(host, "closing failed connection instead of pooling");
            stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        for hook in self.hooks.read().iter() {
            hook.on_release(conn.as_mut());
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let generation = inner.flush_generation;
        let stack = inner.hosts.entry(host.to_string()).or_default();
        if stack.len() >= self.options.max_per_host {
            trace!(host, "per-host cap reached, closing returned connection");
            stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stack.push(IdleConn {
            conn,
            pooled_at: Instant::now(),
            generation,
        });
        stats.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark every idle connection for a health re-check on its next
    /// acquire.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.flush_generation += 1;
        debug!(generation = inner.flush_generation, "flushed connection pool");
    }

    /// Close the pool: drop all idle connections and refuse new acquires.
    /// Outstanding handles close their connections on drop as usual.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained: usize = inner.hosts.values().map(|s| s.len()).sum();
        inner.hosts.clear();
        if drained > 0 {
            warn!(drained, "pool shutdown discarded idle connections");
        }
    }

    /// Idle connections currently pooled for `host`.
    pub fn idle_count(&self, host: &str) -> usize {
        self.inner
            .lock()
            .hosts
            .get(host)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Counters for `host` since pool creation.
    pub fn stats(&self, host: &str) -> Arc<HostStats> {
        self.host_stats(host)
    }
}

/// Owned handle to a pooled connection. Call `release` after a complete,
/// successful conversation; dropping the handle without releasing closes the
/// connection, since a conversation of unknown state must not be resumed by
/// another caller.
pub struct PooledConnection {
    host: String,
    conn: Option<Box<dyn Connection>>,
    failed: bool,
    pool: Weak<ConnectionPool>,
}

impl PooledConnection {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Flag the connection as broken; it will be closed, not pooled.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Return the connection for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release_conn(&self.host, conn, self.failed);
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection present until release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection present until release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            // Not released: the conversation state is unknown, so the
            // connection is discarded rather than pooled.
            if let Some(pool) = self.pool.upgrade() {
                pool.host_stats(&self.host)
                    .discarded
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
