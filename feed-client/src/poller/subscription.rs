use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;
type Entries<A> = Mutex<Vec<(u64, Callback<A>)>>;

/// Ordered set of callbacks that all receive the same value
pub(crate) struct SubscriberList<A> {
    name: &'static str,
    entries: Arc<Entries<A>>,
    next_id: AtomicU64,
}

impl<A> SubscriberList<A>
where
    A: Clone + Send + 'static,
{
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((id, Arc::new(callback)));
        log::debug!("Registered {} subscriber #{}", self.name, id);

        let entries: Weak<Entries<A>> = Arc::downgrade(&self.entries);
        let name = self.name;
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    lock(&entries).retain(|(entry_id, _)| *entry_id != id);
                    log::debug!("Removed {} subscriber #{}", name, id);
                }
            })),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Calls every subscriber in registration order. A panicking subscriber
    /// is logged and skipped.
    pub(crate) fn notify(&self, value: &A) {
        // Callbacks run without the lock so they may (un)subscribe
        let callbacks: Vec<_> = lock(&self.entries)
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        for (id, callback) in callbacks {
            let value = value.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                log::error!("{} subscriber #{} panicked", self.name, id);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle returned by the poller's `on_update`/`on_error`
#[must_use = "the callback stays registered until `unsubscribe` is called"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes exactly the callback this handle was returned for
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifies_in_registration_order() {
        let list = SubscriberList::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = {
            let seen = seen.clone();
            list.subscribe(move |value: u32| seen.lock().unwrap().push(("first", value)))
        };
        let _second = {
            let seen = seen.clone();
            list.subscribe(move |value: u32| seen.lock().unwrap().push(("second", value)))
        };

        list.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_callback() {
        let list = SubscriberList::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            list.subscribe(move |value: u32| seen.lock().unwrap().push(("first", value)))
        };
        let _second = {
            let seen = seen.clone();
            list.subscribe(move |value: u32| seen.lock().unwrap().push(("second", value)))
        };

        first.unsubscribe();
        assert_eq!(list.len(), 1);

        list.notify(&1);
        assert_eq!(*seen.lock().unwrap(), vec![("second", 1)]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let list = SubscriberList::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _faulty = list.subscribe(|_: u32| panic!("subscriber bug"));
        let _healthy = {
            let seen = seen.clone();
            list.subscribe(move |value: u32| seen.lock().unwrap().push(value))
        };

        list.notify(&3);
        list.notify(&4);
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
    }
}
