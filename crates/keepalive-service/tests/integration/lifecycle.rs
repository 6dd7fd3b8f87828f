use std::time::Duration;

use keepalive_service::computation::Computation;
use keepalive_service::services::SharedServices;
use keepalive_service::timers::Scheduled;
use keepalive_test::{self as test, TestComputed};
use tokio::runtime::Handle;
use tokio::time::sleep;

#[tokio::test]
async fn test_output_release_fires_once_after_last_use() {
    test::setup();
    test::pause();
    let services =
        SharedServices::<TestComputed>::with_clock(test::config(), Handle::current(), test::runtime_clock());
    let computed = test::cached(2);

    // t=0
    assert_eq!(services.keep_alive(&computed), Some(Scheduled::Created));

    // t=1s, extends the deadline to t=3s
    sleep(Duration::from_secs(1)).await;
    assert_eq!(services.keep_alive(&computed), Some(Scheduled::Extended));

    // t=2.5s, the original deadline has passed
    sleep(Duration::from_millis(1500)).await;
    assert!(computed.has_output());
    assert_eq!(computed.output_releases(), 0);

    // t=3.5s
    sleep(Duration::from_secs(1)).await;
    assert!(!computed.has_output());
    assert_eq!(computed.output_releases(), 1);
    assert!(services.lifecycle.output_release().is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(computed.output_releases(), 1);

    services.shutdown().await;
}

#[tokio::test]
async fn test_keep_alive_pin_expires() {
    test::setup();
    test::pause();
    let services =
        SharedServices::<TestComputed>::with_clock(test::config(), Handle::current(), test::runtime_clock());
    let computed = test::uncached(500);

    services.keep_alive(&computed);
    sleep(Duration::from_millis(400)).await;
    services.keep_alive(&computed);
    sleep(Duration::from_millis(400)).await;
    assert_eq!(computed.keep_alive_expiries(), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(computed.keep_alive_expiries(), 1);
    // the output is untouched by the keep-alive bucket
    assert!(computed.has_output());

    services.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_pin_never_fires() {
    test::setup();
    test::pause();
    let services =
        SharedServices::<TestComputed>::with_clock(test::config(), Handle::current(), test::runtime_clock());
    let cached = test::cached(1);
    let uncached = test::uncached(1000);

    services.keep_alive(&cached);
    services.keep_alive(&uncached);
    assert!(services.cancel_keep_alive(&cached));
    assert!(services.cancel_keep_alive(&uncached));
    assert!(!services.cancel_keep_alive(&uncached));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(cached.output_releases(), 0);
    assert_eq!(uncached.keep_alive_expiries(), 0);

    services.shutdown().await;
}

#[test]
fn test_bucket_selection() {
    test::setup();
    let (lifecycle, _clock) = test::manual_lifecycle();
    let cached = test::cached(2);
    let uncached = test::uncached(100);
    let pinned = test::pinned_forever();

    lifecycle.keep_alive(&cached);
    assert!(lifecycle.output_release().fire_at(cached.id()).is_some());
    assert!(lifecycle.keep_alive_bucket().fire_at(cached.id()).is_none());

    lifecycle.keep_alive(&uncached);
    assert!(lifecycle.output_release().fire_at(uncached.id()).is_none());
    assert!(lifecycle.keep_alive_bucket().fire_at(uncached.id()).is_some());

    assert_eq!(lifecycle.keep_alive(&pinned), None);
    assert_eq!(lifecycle.output_release().len(), 1);
    assert_eq!(lifecycle.keep_alive_bucket().len(), 1);
}

#[test]
fn test_invalidated_computations_are_left_alone() {
    test::setup();
    let (lifecycle, clock) = test::manual_lifecycle();
    let computed = test::uncached(100);

    lifecycle.keep_alive(&computed);
    let fire_at = lifecycle.keep_alive_bucket().fire_at(computed.id());
    computed.invalidate();

    clock.advance(Duration::from_millis(50));
    assert_eq!(lifecycle.keep_alive(&computed), None);
    assert!(!lifecycle.cancel_keep_alive(&computed));
    assert_eq!(lifecycle.keep_alive_bucket().fire_at(computed.id()), fire_at);
}
