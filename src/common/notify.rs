// Single-shot broadcast notification.
//
// A refresh in flight has one producer and arbitrarily many waiters; every
// waiter observes the same completion value. Built on a watch channel so
// late subscribers see an already-set value immediately.

use tokio::sync::watch;

pub struct Notification<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Notification<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Complete the notification. Only the first call takes effect.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }

    /// Whether the notification has been completed.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for completion and return the value. Returns immediately if the
    /// notification was already set.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("notification sender cannot drop while wait() borrows it");
        value.clone().expect("checked by wait_for")
    }
}

impl<T: Clone> Default for Notification<T> {
    fn default() -> Self {
        Self::new()
    }
}
