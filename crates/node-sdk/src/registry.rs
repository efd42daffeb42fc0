//! Callback registry — maps wire message types to ordered handler lists.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use hearth_protocol::Message;

use crate::types::CallbackResult;

/// Implement this trait to handle a named message type from the hub.
///
/// Handlers run on the Tokio runtime and may perform async I/O. A handler
/// error is logged by the dispatch loop; it never tears down the
/// connection.
///
/// # Example
///
/// ```rust,no_run
/// use hearth_node_sdk::{Callback, CallbackResult};
/// use hearth_protocol::Message;
///
/// struct LogDevices;
///
/// #[async_trait::async_trait]
/// impl Callback for LogDevices {
///     async fn handle(&self, msg: &Message) -> CallbackResult {
///         tracing::info!(body = ?msg.body, "devices updated");
///         Ok(())
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Callback: Send + Sync + 'static {
    async fn handle(&self, msg: &Message) -> CallbackResult;
}

#[async_trait::async_trait]
impl<F, Fut> Callback for F
where
    F: Fn(&Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CallbackResult> + Send + 'static,
{
    async fn handle(&self, msg: &Message) -> CallbackResult {
        self(msg).await
    }
}

/// Registry of message-type handlers.
///
/// Handlers for one type run in registration order; per-connection message
/// ordering is preserved because the client dispatches inbound messages
/// one at a time.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<String, Vec<Arc<dyn Callback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact message type (e.g. `"devices"`).
    ///
    /// Returns `&mut Self` for method chaining.
    pub fn on<C: Callback>(&mut self, message_type: impl Into<String>, cb: C) -> &mut Self {
        self.handlers
            .entry(message_type.into())
            .or_default()
            .push(Arc::new(cb));
        self
    }

    /// Register a pre-wrapped handler.
    pub fn on_boxed(
        &mut self,
        message_type: impl Into<String>,
        cb: Arc<dyn Callback>,
    ) -> &mut Self {
        self.handlers.entry(message_type.into()).or_default().push(cb);
        self
    }

    /// The message types this registry wants, sorted and deduplicated.
    /// Advertised to the hub in the `subscribe` message after connect.
    pub fn subscriptions(&self) -> Vec<String> {
        self.handlers
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether any handler is registered for `message_type`.
    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Run every handler registered for the message's type, in order.
    /// Handler errors are logged and do not stop later handlers.
    pub async fn dispatch(&self, msg: &Message) {
        let Some(handlers) = self.handlers.get(&msg.message_type) else {
            tracing::trace!(message_type = %msg.message_type, "no handler registered");
            return;
        };
        for cb in handlers {
            if let Err(e) = cb.handle(msg).await {
                tracing::error!(
                    message_type = %msg.message_type,
                    error = %e,
                    "message handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Callback for Count {
        async fn handle(&self, _msg: &Message) -> CallbackResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl Callback for Fail {
        async fn handle(&self, _msg: &Message) -> CallbackResult {
            Err(crate::types::NodeSdkError::Config("intentional".into()))
        }
    }

    #[tokio::test]
    async fn dispatch_runs_all_handlers_in_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = CallbackRegistry::new();
        reg.on("devices", Count(hits.clone()));
        reg.on("devices", Count(hits.clone()));

        reg.dispatch(&Message::empty("devices")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_ones() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = CallbackRegistry::new();
        reg.on("devices", Fail);
        reg.on("devices", Count(hits.clone()));

        reg.dispatch(&Message::empty("devices")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_a_no_op() {
        let reg = CallbackRegistry::new();
        reg.dispatch(&Message::empty("nodes")).await;
    }

    #[test]
    fn subscriptions_sorted_and_deduplicated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = CallbackRegistry::new();
        reg.on("nodes", Count(hits.clone()));
        reg.on("devices", Count(hits.clone()));
        reg.on("devices", Count(hits.clone()));
        assert_eq!(reg.subscriptions(), vec!["devices", "nodes"]);
    }
}
