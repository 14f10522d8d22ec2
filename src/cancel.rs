use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

type CancelCallback = Box<dyn FnOnce() + Send>;

// Hierarchical cancellation: a child token is canceled when its parent is,
// never the other way around. Cancellation is level-triggered and idempotent;
// listeners registered after the fact fire immediately.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    canceled: Mutex<bool>,
    changed: Condvar,
    listeners: Mutex<HashMap<u64, CancelCallback>>,
    next_id: AtomicU64,
    // registration this token holds on its parent, weak so a detached
    // subtree never keeps the parent alive
    parent: Mutex<Option<ParentLink>>,
}

struct ParentLink {
    inner: Weak<TokenInner>,
    listener: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                canceled: Mutex::new(false),
                changed: Condvar::new(),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                parent: Mutex::new(None),
            }),
        }
    }

    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let propagated = child.clone();
        let listener = self.on_cancel(move || propagated.cancel());
        *child.inner.parent.lock().expect("parent lock") = Some(ParentLink {
            inner: Arc::downgrade(&self.inner),
            listener: listener.0,
        });
        child
    }

    // Drops the parent's registration for this token. Later parent
    // cancellation no longer reaches it; a no-op for root tokens.
    pub fn detach(&self) {
        let link = self.inner.parent.lock().expect("parent lock").take();
        if let Some(link) = link {
            if let Some(parent) = link.inner.upgrade() {
                parent
                    .listeners
                    .lock()
                    .expect("listener lock")
                    .remove(&link.listener);
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.canceled.lock().expect("cancel lock")
    }

    pub fn cancel(&self) {
        {
            let mut canceled = self.inner.canceled.lock().expect("cancel lock");
            if *canceled {
                return;
            }
            *canceled = true;
        }
        self.inner.changed.notify_all();
        let callbacks = {
            let mut listeners = self.inner.listeners.lock().expect("listener lock");
            listeners.drain().map(|(_, cb)| cb).collect::<Vec<_>>()
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            // the canceled lock is held across the insert so a concurrent
            // cancel() either sees the listener or we observe the flag
            let canceled = self.inner.canceled.lock().expect("cancel lock");
            if !*canceled {
                self.inner
                    .listeners
                    .lock()
                    .expect("listener lock")
                    .insert(id, Box::new(callback));
                return ListenerId(id);
            }
        }
        callback();
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .remove(&id.0);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.listeners.lock().expect("listener lock").len()
    }

    pub fn wait(&self) {
        let mut canceled = self.inner.canceled.lock().expect("cancel lock");
        while !*canceled {
            canceled = self.inner.changed.wait(canceled).expect("cancel lock");
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/cancel_tests.rs"]
mod tests;
