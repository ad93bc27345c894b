//! Pending-retry queue and its periodic drainer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchboard_core::QueueMessage;
use tokio::time::Instant;
use tracing::debug;

use super::BusState;
use crate::worker::BackgroundRunnable;

/// Delay before retry number `retry_count` (1-based): `min(2^retry_count * base, cap)`.
#[must_use]
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry_count)).min(cap)
}

struct PendingRetry {
    due: Instant,
    message: QueueMessage,
}

/// Messages waiting for their backoff to elapse.
///
/// No ordering is kept between entries: a drain returns every due message
/// and later same-type messages may already have been delivered.
#[derive(Default)]
pub(crate) struct RetryQueue {
    pending: Mutex<Vec<PendingRetry>>,
}

impl RetryQueue {
    pub(crate) fn push(&self, message: QueueMessage, delay: Duration) {
        self.pending.lock().push(PendingRetry {
            due: Instant::now() + delay,
            message,
        });
    }

    /// Removes and returns every message whose backoff has elapsed.
    pub(crate) fn take_due(&self) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.due <= now);
        *pending = waiting;
        due.into_iter().map(|p| p.message).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Commands accepted by the retry drainer.
#[derive(Debug)]
pub enum RetryCommand {
    /// Drain due messages now instead of waiting for the next tick.
    DrainNow,
}

/// Background runnable that re-dispatches due retries on every tick.
pub(crate) struct RetryDrainer {
    pub(crate) state: Arc<BusState>,
}

impl RetryDrainer {
    fn drain(&self) {
        let due = self.state.retries.take_due();
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "re-dispatching due retries");
        for message in due {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move { state.dispatch(message).await });
        }
    }
}

#[async_trait]
impl BackgroundRunnable for RetryDrainer {
    type Task = RetryCommand;

    fn name(&self) -> &'static str {
        "retry-drainer"
    }

    async fn run(&mut self, task: RetryCommand) {
        match task {
            RetryCommand::DrainNow => self.drain(),
        }
    }

    async fn on_tick(&mut self) {
        self.drain();
    }
}
