//! Inbound message fan-out
//!
//! An ordered list of handlers. Dispatch copies the list out of the lock
//! before calling anything, so a handler may subscribe, unsubscribe or send
//! without deadlocking.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Message;

/// Callback invoked for every dispatched message
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(SubscriberId, MessageHandler)>,
}

/// Registered inbound-message handlers
#[derive(Default)]
pub struct Subscribers {
    registry: Mutex<Registry>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(existing, _)| *existing != id);
        registry.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `message`, in registration order
    pub fn dispatch(&self, message: &Message) {
        let handlers: Vec<MessageHandler> = self
            .registry
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(message);
        }
    }
}
