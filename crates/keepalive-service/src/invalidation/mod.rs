//! Lets callers wait for a computation to become invalidated.
//!
//! Each computation carries an [`InvalidationEvent`], a one-shot broadcast that is drained exactly
//! once when the computation is invalidated. The [`InvalidationNotifier`] registers a single
//! listener on that event per computation, no matter how many callers are waiting, and fans the
//! notification out to all of them through a [`watch`] channel.
//!
//! Each wait has two parts. The future handed to the caller can be cancelled through its
//! [`CancellationToken`], which only ends that one wait. The listener registered on the
//! computation stays in place until the invalidation actually happens, so cancelling one waiter
//! never affects other waiters or the event itself.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::computation::{Computation, ComputationId};
use crate::utils::sharded::Sharded;

mod event;

pub use event::{InvalidationEvent, Listener, SubscriptionHandle};

/// The number of waiter sets a shard may hold before dead ones are pruned.
const PRUNE_THRESHOLD: usize = 64;

/// A wait for invalidation ended because its [`CancellationToken`] was cancelled.
///
/// This says nothing about whether the computation has been invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("waiting for invalidation was cancelled")]
pub struct WaitCancelled;

/// The waiters of one computation.
///
/// Kept alive by the listener registered on the computation's [`InvalidationEvent`].
struct WaiterSet {
    invalidated: watch::Sender<bool>,
}

#[derive(Default)]
struct WaiterShard {
    sets: FxHashMap<ComputationId, Weak<WaiterSet>>,
    prune_at: usize,
}

impl WaiterShard {
    fn insert(&mut self, id: ComputationId, set: &Arc<WaiterSet>) {
        if self.sets.len() >= self.prune_at {
            self.sets.retain(|_, set| set.strong_count() > 0);
            self.prune_at = (self.sets.len() * 2).max(PRUNE_THRESHOLD);
        }
        self.sets.insert(id, Arc::downgrade(set));
    }
}

/// Hands out futures resolving when a computation is invalidated.
pub struct InvalidationNotifier {
    waiters: Arc<Sharded<WaiterShard>>,
}

impl InvalidationNotifier {
    pub fn new(shards: usize) -> Self {
        Self {
            waiters: Arc::new(Sharded::new(shards)),
        }
    }

    /// Waits until `computation` is invalidated, or until `cancel` is cancelled.
    ///
    /// Resolves right away if the computation already is invalidated, without subscribing to
    /// anything.
    pub fn when_invalidated<C: Computation>(
        &self,
        computation: &C,
        cancel: CancellationToken,
    ) -> WhenInvalidated {
        if computation.is_invalidated() {
            metric!(counter("invalidation.waits") += 1, "path" => "immediate");
            return WhenInvalidated {
                inner: futures::future::ready(Ok(())).boxed(),
            };
        }
        metric!(counter("invalidation.waits") += 1, "path" => "subscribed");

        let mut receiver = self.waiter_set(computation).invalidated.subscribe();
        let inner = async move {
            let invalidated = async {
                let closed = receiver.wait_for(|invalidated| *invalidated).await.is_err();
                // The sender only goes away without sending if the computation is dropped
                // while still alive, in which case it can never be invalidated.
                if closed {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WaitCancelled),
                _ = invalidated => Ok(()),
            }
        };

        WhenInvalidated {
            inner: inner.boxed(),
        }
    }

    /// The number of computations that currently have an invalidation listener registered.
    pub fn waiter_sets(&self) -> usize {
        self.waiters
            .iter()
            .map(|shard| {
                shard
                    .sets
                    .values()
                    .filter(|set| set.strong_count() > 0)
                    .count()
            })
            .sum()
    }

    /// Returns the waiter set of `computation`, registering its listener on first use.
    fn waiter_set<C: Computation>(&self, computation: &C) -> Arc<WaiterSet> {
        let id = computation.id();
        let set = {
            let mut shard = self.waiters.lock(id);
            if let Some(set) = shard.sets.get(&id).and_then(Weak::upgrade) {
                return set;
            }
            let (invalidated, _) = watch::channel(false);
            let set = Arc::new(WaiterSet { invalidated });
            shard.insert(id, &set);
            set
        };

        let listener_set = Arc::clone(&set);
        let waiters = Arc::downgrade(&self.waiters);
        let listener: Listener = Box::new(move || {
            listener_set.invalidated.send_replace(true);
            if let Some(waiters) = waiters.upgrade() {
                waiters.lock(id).sets.remove(&id);
            }
            tracing::trace!(%id, "notified invalidation waiters");
        });

        // Runs the listener inline if the invalidation raced with us.
        computation.invalidation().subscribe(listener);
        set
    }
}

impl Default for InvalidationNotifier {
    fn default() -> Self {
        Self::new(16)
    }
}

impl fmt::Debug for InvalidationNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationNotifier")
            .field("waiter_sets", &self.waiter_sets())
            .finish()
    }
}

/// The future returned by [`InvalidationNotifier::when_invalidated`].
#[must_use = "futures do nothing unless awaited"]
pub struct WhenInvalidated {
    inner: BoxFuture<'static, Result<(), WaitCancelled>>,
}

impl Future for WhenInvalidated {
    type Output = Result<(), WaitCancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for WhenInvalidated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenInvalidated").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::computation::{ComputationOptions, Computed};

    use super::*;

    fn computed() -> Arc<Computed<()>> {
        Arc::new(Computed::new(ComputationOptions::default(), ()))
    }

    #[tokio::test]
    async fn test_immediate_resolution() {
        let notifier = InvalidationNotifier::default();
        let c = computed();
        c.invalidate();

        let result = notifier.when_invalidated(&*c, CancellationToken::new()).await;
        assert_eq!(result, Ok(()));
        assert_eq!(c.invalidation().total_subscriptions(), 0);
        assert_eq!(notifier.waiter_sets(), 0);
    }

    #[tokio::test]
    async fn test_fan_out() {
        let notifier = InvalidationNotifier::default();
        let c = computed();

        let waits: Vec<_> = (0..5)
            .map(|_| notifier.when_invalidated(&*c, CancellationToken::new()))
            .collect();
        assert_eq!(c.invalidation().listener_count(), 1);
        assert_eq!(notifier.waiter_sets(), 1);

        assert!(c.invalidate());
        let results = futures::future::join_all(waits).await;
        assert_eq!(results, vec![Ok(()); 5]);

        assert_eq!(c.invalidation().total_subscriptions(), 1);
        assert_eq!(notifier.waiter_sets(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_isolation() {
        tokio::time::pause();
        let notifier = InvalidationNotifier::default();
        let c = computed();

        let cancel = CancellationToken::new();
        let cancelled = notifier.when_invalidated(&*c, cancel.clone());
        let second = tokio::spawn(notifier.when_invalidated(&*c, CancellationToken::new()));

        cancel.cancel();
        assert_eq!(cancelled.await, Err(WaitCancelled));

        // the shared listener survives the cancelled wait
        assert_eq!(c.invalidation().listener_count(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        c.invalidate();
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_registered_after_cancellation_still_resolves() {
        let notifier = InvalidationNotifier::default();
        let c = computed();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            notifier.when_invalidated(&*c, cancel).await,
            Err(WaitCancelled)
        );

        let wait = notifier.when_invalidated(&*c, CancellationToken::new());
        assert_eq!(c.invalidation().total_subscriptions(), 1);
        c.invalidate();
        assert_eq!(wait.await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_computation_is_pruned() {
        let notifier = InvalidationNotifier::new(1);
        let c = computed();

        let cancel = CancellationToken::new();
        let wait = tokio::spawn(notifier.when_invalidated(&*c, cancel.clone()));
        assert_eq!(notifier.waiter_sets(), 1);

        drop(c);
        assert_eq!(notifier.waiter_sets(), 0);

        // a dropped computation is never invalidated, so only cancellation ends the wait
        cancel.cancel();
        assert_eq!(wait.await.unwrap(), Err(WaitCancelled));
    }
}
