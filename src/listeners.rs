use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use crate::executor::Executor;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A list of callbacks that can be added, removed and iterated concurrently.
///
/// Dispatch works on an immutable snapshot, so a listener registering or cancelling another
/// listener from inside its callback never deadlocks.
pub struct Listeners<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: RwLock<Arc<Vec<(u64, Callback<T>)>>>,
}

/// Cancels a listener registration. Dropping the handle leaves the listener registered.
#[must_use = "dropping the handle keeps the listener registered forever"]
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    /// Stop delivering events to the listener.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Listeners<T> {
    pub fn new() -> Listeners<T> {
        Listeners {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: RwLock::new(Arc::new(Vec::new())),
            }),
        }
    }

    pub fn add(&self, callback: impl Fn(T) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        {
            let mut callbacks = self
                .inner
                .callbacks
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut updated = Vec::clone(&callbacks);
            updated.push((id, callback));
            *callbacks = Arc::new(updated);
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        ListenerHandle {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn clear(&self) {
        *self
            .inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(Vec::new());
    }

    fn snapshot(&self) -> Arc<Vec<(u64, Callback<T>)>> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue one call per listener on `executor`, in registration order.
    pub fn dispatch(&self, executor: &Executor, value: T) {
        for (_, callback) in self.snapshot().iter() {
            let callback = callback.clone();
            let value = value.clone();
            executor.execute(move || callback(value));
        }
    }

    /// Call every listener on the current thread. A panicking listener is logged and skipped.
    pub fn notify_inline(&self, value: T) {
        for (_, callback) in self.snapshot().iter() {
            let value = value.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                log::error!(target: "featurehub", "listener panicked");
            }
        }
    }

    /// Deliver `value` to a single listener without registering it.
    pub fn dispatch_one(
        executor: &Executor,
        value: T,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) {
        executor.execute(move || callback(value));
    }
}

impl<T: Clone + Send + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Listeners::new()
    }
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if callbacks.iter().any(|(existing, _)| *existing == id) {
            let updated = callbacks
                .iter()
                .filter(|(existing, _)| *existing != id)
                .cloned()
                .collect();
            *callbacks = Arc::new(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[test]
    fn delivers_to_every_listener() {
        let executor = Executor::new("listener-test", 1).unwrap();
        let listeners = Listeners::<u32>::new();
        let (sender, receiver) = mpsc::channel();

        let first = sender.clone();
        let _a = listeners.add(move |v| first.send(("a", v)).unwrap());
        let _b = listeners.add(move |v| sender.send(("b", v)).unwrap());

        listeners.dispatch(&executor, 7);

        let mut got = vec![
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn cancelled_listener_is_not_called() {
        let executor = Executor::new("listener-test", 1).unwrap();
        let listeners = Listeners::<u32>::new();
        let (sender, receiver) = mpsc::channel();

        let handle = listeners.add(move |v| sender.send(v).unwrap());
        assert_eq!(listeners.len(), 1);
        handle.cancel();
        assert!(listeners.is_empty());

        listeners.dispatch(&executor, 1);
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let executor = Executor::new("listener-test", 1).unwrap();
        let listeners = Listeners::<u32>::new();
        let (sender, receiver) = mpsc::channel();

        let _a = listeners.add(|_| panic!("bad listener"));
        let _b = listeners.add(move |v| sender.send(v).unwrap());

        listeners.dispatch(&executor, 3);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(3));
    }

    #[test]
    fn cancelling_after_list_is_gone_is_harmless() {
        let listeners = Listeners::<u32>::new();
        let handle = listeners.add(|_| {});
        drop(listeners);
        handle.cancel();
    }
}
