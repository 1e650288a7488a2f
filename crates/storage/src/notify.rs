use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

/// Change listener; receives the store revision that triggered the notification.
pub type Listener = Arc<dyn Fn(u64) + Send + Sync + 'static>;

#[derive(Default)]
struct DispatchQueue {
    pending: Option<u64>,
    draining: bool,
}

/// Pending-notification queue drained at the end of every public store mutation.
///
/// Listeners always run outside the store's state lock. A mutation issued from
/// inside a listener only enqueues its revision; the flush already in progress
/// picks it up, so listeners are never re-entered.
pub(crate) struct Notifier {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    queue: Mutex<DispatchQueue>,
    revision_tx: watch::Sender<u64>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            queue: Mutex::new(DispatchQueue::default()),
            revision_tx,
        }
    }

    pub(crate) fn register(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener));
        Subscription {
            notifier: Arc::downgrade(self),
            id: Some(id),
        }
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn remove(&self, id: u64) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    /// Enqueues `revision` and drains the queue unless a drain is already running.
    pub(crate) fn publish(&self, revision: u64) {
        self.revision_tx.send_replace(revision);

        {
            let mut queue = lock(&self.queue);
            queue.pending = Some(queue.pending.map_or(revision, |queued| queued.max(revision)));
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let revision = {
                let mut queue = lock(&self.queue);
                match queue.pending.take() {
                    Some(revision) => revision,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let listeners = lock(&self.listeners)
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect::<Vec<_>>();

            for listener in listeners {
                if panic::catch_unwind(AssertUnwindSafe(|| listener(revision))).is_err() {
                    tracing::error!(revision, "conversation store listener panicked");
                }
            }
        }
    }
}

/// Handle returned by `subscribe`; the listener is removed on drop or `unsubscribe`.
#[must_use = "dropping a subscription unsubscribes its listener"]
pub struct Subscription {
    notifier: Weak<Notifier>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(notifier)) = (self.id.take(), self.notifier.upgrade()) {
            notifier.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
