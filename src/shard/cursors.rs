// Open-cursor accounting. A moved range cannot be deleted out from under a
// client still iterating it; the post-migration sweep waits for cursors on
// the collection to drain, then forcibly invalidates stragglers once the
// wait budget is spent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use crate::common::Namespace;

pub type CursorId = u64;

#[derive(Default)]
struct CursorTable {
    open: HashMap<CursorId, Namespace>,
}

pub struct CursorRegistry {
    table: Mutex<CursorTable>,
    next_id: AtomicU64,
    changed: Notify,
    self_ref: Weak<CursorRegistry>,
}

impl CursorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            table: Mutex::new(CursorTable::default()),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Register an open cursor; the guard closes it on drop.
    pub fn open(&self, ns: Namespace) -> CursorGuard {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.table.lock().open.insert(id, ns);
        CursorGuard {
            id,
            registry: self.self_ref.clone(),
        }
    }

    pub fn open_count(&self, ns: &Namespace) -> usize {
        self.table
            .lock()
            .open
            .values()
            .filter(|cursor_ns| *cursor_ns == ns)
            .count()
    }

    fn close(&self, id: CursorId) {
        self.table.lock().open.remove(&id);
        self.changed.notify_waiters();
    }

    /// Forcibly invalidate every cursor on `ns`. Guards of invalidated
    /// cursors become inert. Returns how many were killed.
    pub fn invalidate(&self, ns: &Namespace) -> usize {
        let mut table = self.table.lock();
        let before = table.open.len();
        table.open.retain(|_, cursor_ns| cursor_ns != ns);
        let killed = before - table.open.len();
        drop(table);
        if killed > 0 {
            warn!(ns = %ns, killed, "forcibly invalidated open cursors");
            self.changed.notify_waiters();
        }
        killed
    }

    /// Wait until no cursor remains open on `ns`, up to `timeout`. Returns
    /// `true` if the namespace drained on its own.
    pub async fn wait_until_clear(&self, ns: &Namespace, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before the check so a concurrent close
            // between check and wait cannot be missed.
            let notified = self.changed.notified();
            if self.open_count(ns) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

pub struct CursorGuard {
    id: CursorId,
    registry: Weak<CursorRegistry>,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.close(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("db", "c")
    }

    #[tokio::test]
    async fn test_open_close_counts() {
        let registry = CursorRegistry::new();
        let a = registry.open(ns());
        let _b = registry.open(ns());
        let _other = registry.open(Namespace::new("db", "other"));
        assert_eq!(registry.open_count(&ns()), 2);

        drop(a);
        assert_eq!(registry.open_count(&ns()), 1);
    }

    #[tokio::test]
    async fn test_wait_until_clear_observes_drop() {
        let registry = CursorRegistry::new();
        let guard = registry.open(ns());

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_until_clear(&ns(), Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out_then_invalidate() {
        let registry = CursorRegistry::new();
        let _guard = registry.open(ns());

        let drained = registry
            .wait_until_clear(&ns(), Duration::from_millis(20))
            .await;
        assert!(!drained);

        assert_eq!(registry.invalidate(&ns()), 1);
        assert_eq!(registry.open_count(&ns()), 0);
        // The guard is now inert; dropping it is harmless.
    }
}
