//! Name-keyed handler registry shared by the local bus and the broker.
//!
//! Many concurrent dispatches read the registry while subscriptions take the
//! write lock briefly. Dispatch clones the handler list out of the lock, so
//! running handlers never hold it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::bus::SubscriptionId;
use crate::error::BusError;
use crate::handler::EventHandler;

pub struct HandlerRegistry<E> {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, EventHandler<E>)>>>,
    next_id: AtomicU64,
}

impl<E> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> HandlerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the handlers of `name` (surrounding whitespace ignored).
    pub fn subscribe(&self, name: &str, handler: EventHandler<E>) -> Result<SubscriptionId, BusError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BusError::EmptyEventName);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(name.to_string()).or_default().push((id, handler));
        Ok(id)
    }

    /// Remove one registration, keeping the order of the others.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        let name = name.trim();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };

        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    /// Snapshot of the handlers for `name`, in registration order.
    pub fn handlers(&self, name: &str) -> Vec<EventHandler<E>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .get(name)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, name: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(name).is_some_and(|list| !list.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> EventHandler<u32> {
        let log = log.clone();
        handler_fn(move |_: u32| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag);
                Ok(())
            }
        })
    }

    #[test]
    fn rejects_blank_names() {
        let registry = HandlerRegistry::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            registry.subscribe("   ", recording(&log, "a")),
            Err(BusError::EmptyEventName)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_keeps_order_of_remaining_handlers() {
        let registry = HandlerRegistry::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(" created ", recording(&log, "a")).unwrap();
        let b = registry.subscribe("created", recording(&log, "b")).unwrap();
        registry.subscribe("created", recording(&log, "c")).unwrap();

        assert!(registry.unsubscribe("created", b));
        assert!(!registry.unsubscribe("created", b));

        for handler in registry.handlers("created") {
            handler(1).await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "c"]);
        assert!(registry.handlers("deleted").is_empty());
        assert!(registry.has_handlers("created"));
    }
}
