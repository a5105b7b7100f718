//! Message listeners
//!
//! Every inbound frame not claimed by a pending request is fanned out to the
//! registered listeners. Registration returns a [`ListenerHandle`]; dropping the
//! handle unregisters the listener.

use parking_lot::RwLock;
use robolink_core::ResponseMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receiver of unsolicited device messages.
///
/// Called on the router's dispatch task; implementations must not block.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &ResponseMessage);
}

impl<F> MessageListener for F
where
    F: Fn(&ResponseMessage) + Send + Sync,
{
    fn on_message(&self, message: &ResponseMessage) {
        self(message)
    }
}

#[derive(Default)]
struct Registry {
    listeners: RwLock<Vec<(u64, Arc<dyn MessageListener>)>>,
    next_id: AtomicU64,
}

/// Set of registered listeners
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Registry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn MessageListener>) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, listener));

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `message` to every listener in registration order
    pub fn dispatch(&self, message: &ResponseMessage) {
        // Snapshot so listeners may register or unregister while being called
        let listeners: Vec<Arc<dyn MessageListener>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        trace!(duid = %message.duid, listeners = listeners.len(), "Dispatching message");
        for listener in listeners {
            listener.on_message(message);
        }
    }
}

/// Keeps a listener registered while alive
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Registry>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}
