use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use keepalive_service::clock::{Clock, ManualClock};
use keepalive_service::computation::Computation;
use keepalive_service::config::TimersConfig;
use keepalive_service::timers::{DelayScheduler, FireAction};
use keepalive_test::{self as test, TestComputed};

#[test]
fn test_concurrent_scheduling_keeps_latest_deadline() {
    test::setup();
    let clock = Arc::new(ManualClock::new());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let action: FireAction<TestComputed> = Box::new(move |_: &Arc<TestComputed>| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let timers = Arc::new(DelayScheduler::new(
        "concurrent",
        &TimersConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        action,
    ));
    let start = clock.now();
    let computations: Vec<_> = (0..64).map(|_| test::cached(1)).collect();

    thread::scope(|scope| {
        for offset in 1..=8u64 {
            let timers = &timers;
            let computations = &computations;
            scope.spawn(move || {
                for computed in computations {
                    let target = start + Duration::from_secs(offset);
                    timers.add_or_update_to_later(computed, target);
                    // removals race with the additions of other threads
                    if offset == 4 {
                        timers.remove(computed.id());
                    }
                }
            });
        }
    });

    // every computation is scheduled at most once, never earlier than the last thread asked for
    assert!(timers.len() <= computations.len());
    for computed in &computations {
        if let Some(fire_at) = timers.fire_at(computed.id()) {
            assert!(fire_at > start);
            assert!(fire_at <= start + Duration::from_secs(8));
        }
    }

    clock.advance(Duration::from_secs(8));
    let pending = timers.len();
    assert_eq!(timers.fire_due(clock.now()), pending);
    assert_eq!(fired.load(Ordering::SeqCst), pending);
    assert!(timers.is_empty());
}
