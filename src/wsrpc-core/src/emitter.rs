use crate::message::Notification;
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace};

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    once: bool,
    handler: NotificationHandler,
}

/// Fan-out of server notifications to handlers registered by method name.
///
/// Handlers run synchronously in registration order. A panicking handler is
/// logged and does not prevent the remaining handlers from running.
#[derive(Default)]
pub struct NotificationEmitter {
    next_id: AtomicU64,
    subscribers: DashMap<String, Vec<Subscriber>>,
}

impl NotificationEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.add(method.into(), false, Arc::new(handler))
    }

    pub fn subscribe_once<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.add(method.into(), true, Arc::new(handler))
    }

    fn add(&self, method: String, once: bool, handler: NotificationHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(%method, once, "subscribing to notification");
        self.subscribers
            .entry(method)
            .or_default()
            .push(Subscriber { id, once, handler });
        id
    }

    pub fn unsubscribe(&self, method: &str, id: SubscriptionId) -> bool {
        let removed = match self.subscribers.get_mut(method) {
            Some(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.id != id);
                subscribers.len() != before
            }
            None => false,
        };
        self.subscribers.remove_if(method, |_, subscribers| subscribers.is_empty());
        removed
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.subscribers.get(method).map_or(0, |s| s.len())
    }

    pub fn emit(&self, notification: &Notification) -> usize {
        let handlers: Vec<NotificationHandler> = {
            let Some(mut subscribers) = self.subscribers.get_mut(&notification.method) else {
                return 0;
            };
            let handlers = subscribers.iter().map(|s| s.handler.clone()).collect();
            subscribers.retain(|s| !s.once);
            handlers
        };
        self.subscribers
            .remove_if(&notification.method, |_, subscribers| subscribers.is_empty());

        // the map is unlocked here, so handlers may subscribe or unsubscribe
        for handler in &handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                error!(method = %notification.method, "notification handler panicked");
            }
        }

        handlers.len()
    }
}
