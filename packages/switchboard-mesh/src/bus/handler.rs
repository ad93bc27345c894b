use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use switchboard_core::QueueMessage;

/// A subscriber's reaction to one message type.
///
/// Returning an error fails the whole message: the bus retries it with
/// backoff and eventually dead-letters it, even if other handlers succeeded.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        (self.0)(message.clone()).await
    }
}

/// Wraps an async closure taking an owned message.
///
/// ```ignore
/// bus.subscribe(MessageType::DeployStarted, handler_fn(|msg| async move {
///     tracing::info!(id = %msg.id, "deployment started");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// Identifies one registered handler inside the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

/// Monotonic allocator for [`HandlerId`]s. Ids start at 1.
#[derive(Debug)]
pub(crate) struct HandlerIds(AtomicU64);

impl HandlerIds {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> HandlerId {
        HandlerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}
