//! Session event fan-out
//!
//! Listeners are registered per [`EventKind`] and removed through the
//! [`Subscription`] handed back at registration time.

use crate::domain::models::{EventKind, SessionEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

type Handler<P> = Arc<dyn Fn(&SessionEvent<P>) + Send + Sync>;

struct Registry<P> {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler<P>)>>,
}

pub struct EventBus<P> {
    inner: Arc<Mutex<Registry<P>>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }
}

impl<P: 'static> EventBus<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent<P>) + Send + Sync + 'static,
    {
        let handler: Handler<P> = Arc::new(handler);
        let id = match self.inner.lock() {
            Ok(mut registry) => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.handlers.entry(kind).or_default().push((id, handler));
                id
            }
            Err(_) => return Subscription::detached(),
        };

        let weak: Weak<Mutex<Registry<P>>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Mutex::new(Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut registry) = inner.lock() {
                        if let Some(list) = registry.handlers.get_mut(&kind) {
                            list.retain(|(other, _)| *other != id);
                        }
                    }
                }
            }))),
        }
    }

    /// Deliver `event` to every handler registered for its kind
    ///
    /// Handlers run without the registry lock held, so they may subscribe or
    /// detach freely.
    pub fn emit(&self, event: &SessionEvent<P>) {
        let handlers: Vec<Handler<P>> = match self.inner.lock() {
            Ok(registry) => registry
                .handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        trace!("Emitting {:?} to {} listener(s)", event.kind(), handlers.len());
        for handler in handlers {
            handler(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .map(|registry| registry.handlers.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Remove every listener of every kind
    pub fn clear(&self) {
        if let Ok(mut registry) = self.inner.lock() {
            registry.handlers.clear();
        }
    }
}

/// Detach handle returned by [`EventBus::on`]
///
/// Dropping it keeps the listener attached.
pub struct Subscription {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn detached() -> Self {
        Self {
            detach: Mutex::new(None),
        }
    }

    /// Remove the listener. Calling this more than once is a no-op.
    pub fn detach(&self) {
        let detach = self.detach.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detach) = detach {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self.detach.lock().map(|s| s.is_some()).unwrap_or(false);
        f.debug_struct("Subscription")
            .field("attached", &attached)
            .finish()
    }
}
