//! Provides the lifecycle services and a way to initialize them.
//!
//! [`SharedServices::new`] wires up the [`LifecycleService`] and the [`InvalidationNotifier`]
//! according to the provided [`Config`], sharing a single [`Clock`] between them, and starts the
//! firing loops of the delay buckets on the given runtime.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, MonotonicClock};
use crate::computation::Computation;
use crate::config::Config;
use crate::invalidation::{InvalidationNotifier, WhenInvalidated};
use crate::lifecycle::LifecycleService;
use crate::timers::Scheduled;

#[derive(Debug)]
pub struct SharedServices<C: Computation> {
    pub config: Config,
    pub lifecycle: LifecycleService<C>,
    pub notifier: InvalidationNotifier,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Computation> SharedServices<C> {
    /// Creates the services with a [`MonotonicClock`] and starts them on `runtime`.
    pub fn new(config: Config, runtime: Handle) -> Self {
        Self::with_clock(config, runtime, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: Config, runtime: Handle, clock: Arc<dyn Clock>) -> Self {
        let lifecycle = LifecycleService::new(&config.timers, clock);
        let notifier = InvalidationNotifier::new(config.timers.shards);
        let tasks = Mutex::new(lifecycle.start(&runtime).into());

        Self {
            config,
            lifecycle,
            notifier,
            tasks,
        }
    }

    /// See [`LifecycleService::keep_alive`].
    pub fn keep_alive(&self, computation: &Arc<C>) -> Option<Scheduled> {
        self.lifecycle.keep_alive(computation)
    }

    /// See [`LifecycleService::cancel_keep_alive`].
    pub fn cancel_keep_alive(&self, computation: &C) -> bool {
        self.lifecycle.cancel_keep_alive(computation)
    }

    /// See [`InvalidationNotifier::when_invalidated`].
    pub fn when_invalidated(&self, computation: &C, cancel: CancellationToken) -> WhenInvalidated {
        self.notifier.when_invalidated(computation, cancel)
    }

    /// Stops the firing loops and waits for them to exit.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(error) = task.await {
                tracing::error!(%error, "delay scheduler task failed");
            }
        }
    }
}
