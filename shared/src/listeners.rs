//! Plain observer registry: `subscribe(listener) -> Subscription`.

use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                    registry.listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Calls every listener with `value`.
    ///
    /// The registry lock is released first, so listeners may subscribe or
    /// unsubscribe from inside the callback.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`. Dropping it detaches the listener.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
