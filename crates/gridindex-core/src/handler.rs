//! Event handler trait + registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProjectionError;
use crate::event::{EventContext, EventKind, GridEvent};

/// Applies one kind of [`GridEvent`] to the entity store.
///
/// Implement this to project additional state alongside the built-in
/// handlers. A handler must apply its event all-or-nothing.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &GridEvent, ctx: &EventContext) -> Result<(), ProjectionError>;

    /// The event kind this handler processes.
    fn kind(&self) -> EventKind;
}

/// Registry of event handlers, keyed by event kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers for the same kind run in registration order.
    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(handler.kind()).or_default().push(handler);
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Dispatch an event to every handler of its kind, stopping at the first
    /// error. Returns the number of handlers that ran.
    pub async fn dispatch(
        &self,
        event: &GridEvent,
        ctx: &EventContext,
    ) -> Result<usize, ProjectionError> {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return Ok(0);
        };
        for handler in handlers {
            handler.handle(event, ctx).await?;
        }
        Ok(handlers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WithdrawEvent;
    use alloy_primitives::U256;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>, EventKind);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _e: &GridEvent, _c: &EventContext) -> Result<(), ProjectionError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn kind(&self) -> EventKind {
            self.1
        }
    }

    fn withdraw() -> GridEvent {
        GridEvent::Withdraw(WithdrawEvent {
            provider: "0xaa".into(),
            amount: U256::from(1u64),
        })
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.on_event(Arc::new(Counter(count.clone(), EventKind::Withdraw)));
        registry.on_event(Arc::new(Counter(count.clone(), EventKind::Register)));

        let ctx = EventContext::at_block(1, 0);
        assert_eq!(registry.dispatch(&withdraw(), &ctx).await.unwrap(), 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(registry.handles(EventKind::Register));
        assert!(!registry.handles(EventKind::AddNode));
    }
}
