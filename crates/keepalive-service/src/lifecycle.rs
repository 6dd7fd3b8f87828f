//! Decides how long a computation stays pinned after it was used.
//!
//! Every use of a computation should be followed by [`LifecycleService::keep_alive`]. Depending on
//! the [`PinPolicy`] of the computation this either defers the release of its cached output, or
//! defers the end of its keep-alive pin. Caching computations keep their output for a bounded
//! window after their last use, while uncached ones only get a short pin which avoids needless
//! recomputation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::computation::{Computation, PinPolicy};
use crate::config::TimersConfig;
use crate::timers::{DelayScheduler, Scheduled};

/// Drives the output-release and keep-alive buckets.
pub struct LifecycleService<C: Computation> {
    clock: Arc<dyn Clock>,
    output_release: Arc<DelayScheduler<C>>,
    keep_alive: Arc<DelayScheduler<C>>,
}

impl<C: Computation> LifecycleService<C> {
    pub fn new(config: &TimersConfig, clock: Arc<dyn Clock>) -> Self {
        let output_release = DelayScheduler::new(
            "output_release",
            config,
            Arc::clone(&clock),
            Box::new(|computation: &Arc<C>| computation.release_output()),
        );
        let keep_alive = DelayScheduler::new(
            "keep_alive",
            config,
            Arc::clone(&clock),
            Box::new(|computation: &Arc<C>| computation.keep_alive_expired()),
        );

        Self {
            clock,
            output_release: Arc::new(output_release),
            keep_alive: Arc::new(keep_alive),
        }
    }

    /// Spawns the firing loops of both buckets onto `handle`.
    pub fn start(&self, handle: &Handle) -> [JoinHandle<()>; 2] {
        [
            self.output_release.start(handle),
            self.keep_alive.start(handle),
        ]
    }

    /// Stops the firing loops of both buckets.
    pub fn shutdown(&self) {
        self.output_release.shutdown();
        self.keep_alive.shutdown();
    }

    /// Pins `computation` for another full window starting now.
    ///
    /// Does nothing for invalidated computations. Returns `None` if no bucket was touched.
    pub fn keep_alive(&self, computation: &Arc<C>) -> Option<Scheduled> {
        if computation.is_invalidated() {
            return None;
        }
        let (bucket, after) = self.bucket_for(computation.pin_policy())?;
        Some(bucket.add_or_update_to_later(computation, self.clock.now() + after))
    }

    /// Removes the pin of `computation`, if it has one.
    ///
    /// Does nothing for invalidated computations.
    pub fn cancel_keep_alive(&self, computation: &C) -> bool {
        if computation.is_invalidated() {
            return false;
        }
        match self.bucket_for(computation.pin_policy()) {
            Some((bucket, _)) => bucket.remove(computation.id()),
            None => false,
        }
    }

    fn bucket_for(&self, policy: PinPolicy) -> Option<(&DelayScheduler<C>, Duration)> {
        match policy {
            PinPolicy::PinByOutputRelease(after) => Some((self.output_release.as_ref(), after)),
            PinPolicy::PinByKeepAlive(after) => Some((self.keep_alive.as_ref(), after)),
            PinPolicy::NoPin => None,
        }
    }

    /// The bucket that releases cached outputs.
    pub fn output_release(&self) -> &Arc<DelayScheduler<C>> {
        &self.output_release
    }

    /// The bucket that ends keep-alive pins.
    pub fn keep_alive_bucket(&self) -> &Arc<DelayScheduler<C>> {
        &self.keep_alive
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl<C: Computation> fmt::Debug for LifecycleService<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleService")
            .field("clock", &self.clock)
            .field("output_release", &self.output_release)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl<C: Computation> Drop for LifecycleService<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::computation::{ComputationOptions, Computed, Timeout};

    use super::*;

    fn service(clock: &Arc<ManualClock>) -> LifecycleService<Computed<u32>> {
        LifecycleService::new(&TimersConfig::default(), clock.clone())
    }

    #[test]
    fn test_bucket_selection() {
        let clock = Arc::new(ManualClock::new());
        let service = service(&clock);

        let cached = Arc::new(Computed::new(ComputationOptions::cached(Timeout::from_secs(2)), 1));
        assert_eq!(service.keep_alive(&cached), Some(Scheduled::Created));
        assert_eq!(service.output_release().len(), 1);
        assert!(service.keep_alive_bucket().is_empty());

        let uncached = Arc::new(Computed::new(ComputationOptions::uncached(Timeout::from_secs(1)), 2));
        assert_eq!(service.keep_alive(&uncached), Some(Scheduled::Created));
        assert_eq!(service.output_release().len(), 1);
        assert_eq!(service.keep_alive_bucket().len(), 1);

        let pinned = Arc::new(Computed::new(ComputationOptions::pinned_forever(), 3));
        assert_eq!(service.keep_alive(&pinned), None);
        assert_eq!(service.output_release().len(), 1);
        assert_eq!(service.keep_alive_bucket().len(), 1);
    }

    #[test]
    fn test_cancel_uses_same_bucket() {
        let clock = Arc::new(ManualClock::new());
        let service = service(&clock);

        let uncached = Arc::new(Computed::new(ComputationOptions::uncached(Timeout::from_secs(1)), 1));
        service.keep_alive(&uncached);

        assert!(service.cancel_keep_alive(&uncached));
        assert!(!service.cancel_keep_alive(&uncached));
        assert!(service.keep_alive_bucket().is_empty());
    }

    #[test]
    fn test_invalidated_short_circuit() {
        let clock = Arc::new(ManualClock::new());
        let service = service(&clock);
        let cached = Arc::new(Computed::new(ComputationOptions::cached(Timeout::from_secs(2)), 1));

        service.keep_alive(&cached);
        let fire_at = service.output_release().fire_at(cached.id());
        cached.invalidate();

        clock.advance(Duration::from_secs(1));
        assert_eq!(service.keep_alive(&cached), None);
        assert!(!service.cancel_keep_alive(&cached));
        assert_eq!(service.output_release().fire_at(cached.id()), fire_at);
        assert_eq!(service.output_release().len(), 1);
    }

    #[test]
    fn test_output_release_scenario() {
        let clock = Arc::new(ManualClock::new());
        let service = service(&clock);
        let start = clock.now();
        let cached = Arc::new(Computed::new(ComputationOptions::cached(Timeout::from_secs(2)), 7));

        service.keep_alive(&cached);
        assert_eq!(
            service.output_release().fire_at(cached.id()),
            Some(start + Duration::from_secs(2))
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(service.keep_alive(&cached), Some(Scheduled::Extended));
        assert_eq!(
            service.output_release().fire_at(cached.id()),
            Some(start + Duration::from_secs(3))
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(service.output_release().fire_due(clock.now()), 0);
        assert_eq!(cached.output(), Some(7));

        clock.advance(Duration::from_secs(1));
        assert_eq!(service.output_release().fire_due(clock.now()), 1);
        assert_eq!(cached.output(), None);
        assert_eq!(cached.output_releases(), 1);
        assert!(service.output_release().is_empty());

        assert_eq!(service.output_release().fire_due(clock.now()), 0);
        assert_eq!(cached.output_releases(), 1);
    }

    #[test]
    fn test_keep_alive_expiry() {
        let clock = Arc::new(ManualClock::new());
        let service = service(&clock);
        let uncached = Arc::new(Computed::new(ComputationOptions::uncached(Timeout::from_millis(500)), 1));

        service.keep_alive(&uncached);
        clock.advance(Duration::from_millis(500));
        assert_eq!(service.keep_alive_bucket().fire_due(clock.now()), 1);
        assert_eq!(uncached.keep_alive_expiries(), 1);
        assert_eq!(uncached.output_releases(), 0);

        // a fresh use after firing creates a fresh entry
        assert_eq!(service.keep_alive(&uncached), Some(Scheduled::Created));
    }
}
