//! Helpers for testing the lifecycle services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests that rely on the firing loops should run on a paused runtime, see [`pause`], so that
//!    deadlines are reached deterministically and without actually waiting.

use std::sync::Arc;
use std::time::Duration;

use keepalive_service::clock::{Clock, ManualClock, MonotonicClock};
use keepalive_service::computation::{ComputationOptions, Computed, Timeout};
use keepalive_service::config::{Config, TimersConfig};
use keepalive_service::lifecycle::LifecycleService;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub type TestComputed = Computed<String>;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `keepalive_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("keepalive_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Pauses the tokio clock of the current runtime.
///
/// Must be called from within a `current_thread` runtime, which is what `#[tokio::test]` uses.
pub fn pause() {
    tokio::time::pause();
}

/// A computation whose output is released `secs` seconds after its last use.
pub fn cached(secs: u64) -> Arc<TestComputed> {
    Arc::new(Computed::new(
        ComputationOptions::cached(Timeout::from_secs(secs)),
        format!("cached for {secs}s"),
    ))
}

/// A computation that stays pinned for `millis` milliseconds after its last use.
pub fn uncached(millis: u64) -> Arc<TestComputed> {
    Arc::new(Computed::new(
        ComputationOptions::uncached(Duration::from_millis(millis)),
        format!("pinned for {millis}ms"),
    ))
}

/// A computation that is never scheduled.
pub fn pinned_forever() -> Arc<TestComputed> {
    Arc::new(Computed::new(
        ComputationOptions::pinned_forever(),
        "pinned forever".into(),
    ))
}

/// A test configuration with few shards, to exercise shard collisions.
pub fn config() -> Config {
    Config {
        timers: TimersConfig {
            shards: 2,
            min_extension: None,
        },
        ..Default::default()
    }
}

/// A lifecycle service driven by a [`ManualClock`].
///
/// The firing loops are not started, fire due entries by hand with
/// [`DelayScheduler::fire_due`](keepalive_service::timers::DelayScheduler::fire_due).
pub fn manual_lifecycle() -> (LifecycleService<TestComputed>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let lifecycle = LifecycleService::new(&config().timers, Arc::clone(&clock) as Arc<dyn Clock>);
    (lifecycle, clock)
}

/// A clock reading the (possibly paused) runtime time.
pub fn runtime_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}
