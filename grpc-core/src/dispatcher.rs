//! The completion dispatcher (section 4.5): correlates a batch's tag with
//! the waiter expecting its outcome and guarantees exactly-once delivery.
//!
//! Registration happens before submission so that a completion can never
//! observe an unknown tag (section 4.3). A single background worker drains
//! a channel of `(Tag, Outcome)` pairs and wakes the matching waiter;
//! `shutdown()` completes every still-registered batch as `Cancelled`
//! rather than leaving any waiter hanging forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::batch::{Outcome, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Draining,
    Shutdown,
}

struct Shared {
    state: Mutex<RunState>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    completions: mpsc::UnboundedSender<(Tag, Outcome)>,
}

/// Returned by `register` when the dispatcher has already started
/// shutting down and is no longer accepting new registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherShuttingDown;

/// Owns the completion queue for one connection's worth of calls.
///
/// Cloning a `Dispatcher` shares the same background worker and waiter
/// table; this mirrors how a single completion queue serves every call on
/// a connection (section 4.5).
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawn the dispatcher's background worker on the current Tokio
    /// runtime and return a handle to it.
    pub fn spawn() -> Dispatcher {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Tag, Outcome)>();
        let shared = Arc::new(Shared {
            state: Mutex::new(RunState::Running),
            waiters: Mutex::new(HashMap::new()),
            completions: tx,
        });

        let worker_shared = shared.clone();
        tokio::spawn(async move {
            while let Some((tag, outcome)) = rx.recv().await {
                let sender = worker_shared.waiters.lock().unwrap().remove(&tag.value());
                if let Some(sender) = sender {
                    let _ = sender.send(outcome);
                }
            }
        });

        Dispatcher { shared }
    }

    /// Register `tag` so that a later `complete(tag, _)` can be delivered.
    /// Must be called before the batch carrying `tag` is submitted to the
    /// transport (section 4.3's atomicity requirement).
    pub fn register(&self, tag: Tag) -> Result<oneshot::Receiver<Outcome>, DispatcherShuttingDown> {
        if *self.shared.state.lock().unwrap() != RunState::Running {
            return Err(DispatcherShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().unwrap().insert(tag.value(), tx);
        Ok(rx)
    }

    /// Unregister a tag whose batch failed to submit, per section 4.3:
    /// "retract on failure" so a submission error never leaves a waiter
    /// registered for a completion that will never arrive.
    pub fn retract(&self, tag: Tag) {
        self.shared.waiters.lock().unwrap().remove(&tag.value());
    }

    /// Deliver `outcome` for `tag`. Safe to call from any task; internally
    /// just enqueues onto the worker's channel.
    pub fn complete(&self, tag: Tag, outcome: Outcome) {
        let _ = self.shared.completions.send((tag, outcome));
    }

    pub fn waiter_count(&self) -> usize {
        self.shared.waiters.lock().unwrap().len()
    }

    /// Stop accepting new registrations and resolve every still-registered
    /// waiter with `Outcome::Cancelled` (section 4.5: "no waiter is ever
    /// abandoned").
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == RunState::Shutdown {
                return;
            }
            *state = RunState::Draining;
        }
        let waiters: Vec<_> = {
            let mut waiters = self.shared.waiters.lock().unwrap();
            waiters.drain().collect()
        };
        tracing::debug!(cancelled = waiters.len(), "dispatcher shutting down");
        for (_, sender) in waiters {
            let _ = sender.send(Outcome::Cancelled);
        }
        *self.shared.state.lock().unwrap() = RunState::Shutdown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::TagAllocator;

    #[tokio::test]
    async fn completion_is_delivered_to_the_matching_waiter() {
        let dispatcher = Dispatcher::spawn();
        let alloc = TagAllocator::new();
        let tag = alloc.next();
        let rx = dispatcher.register(tag).unwrap();
        dispatcher.complete(tag, Outcome::Success);
        let outcome = rx.await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn retract_prevents_a_stale_completion_from_finding_a_waiter() {
        let dispatcher = Dispatcher::spawn();
        let alloc = TagAllocator::new();
        let tag = alloc.next();
        let _rx = dispatcher.register(tag).unwrap();
        dispatcher.retract(tag);
        assert_eq!(dispatcher.waiter_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_outstanding_waiter() {
        let dispatcher = Dispatcher::spawn();
        let alloc = TagAllocator::new();
        let a = dispatcher.register(alloc.next()).unwrap();
        let b = dispatcher.register(alloc.next()).unwrap();
        dispatcher.shutdown();
        assert_eq!(a.await.unwrap(), Outcome::Cancelled);
        assert_eq!(b.await.unwrap(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn register_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::spawn();
        dispatcher.shutdown();
        let alloc = TagAllocator::new();
        assert!(dispatcher.register(alloc.next()).is_err());
    }
}
