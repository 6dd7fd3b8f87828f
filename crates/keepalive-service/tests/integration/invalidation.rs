use std::sync::Arc;
use std::time::Duration;

use keepalive_service::computation::Computation;
use keepalive_service::invalidation::{InvalidationNotifier, WaitCancelled};
use keepalive_test as test;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_resolve_exactly_once() {
    test::setup();
    let notifier = Arc::new(InvalidationNotifier::default());
    let computed = test::cached(60);

    let waiters: Vec<_> = (0..32)
        .map(|_| {
            let notifier = Arc::clone(&notifier);
            let computed = Arc::clone(&computed);
            tokio::spawn(async move {
                notifier
                    .when_invalidated(&*computed, CancellationToken::new())
                    .await
            })
        })
        .collect();

    // give the waiters a chance to register
    while computed.invalidation().total_subscriptions() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(computed.invalidate());
    assert!(!computed.invalidate());

    let mut resolved = 0;
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Ok(()));
        resolved += 1;
    }
    assert_eq!(resolved, 32);

    // however the waiters raced, the broadcast only ever had one listener
    assert_eq!(computed.invalidation().total_subscriptions(), 1);
    assert_eq!(notifier.waiter_sets(), 0);
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_affect_others() {
    test::setup();
    let notifier = InvalidationNotifier::default();
    let computed = test::uncached(100);

    let first_cancel = CancellationToken::new();
    let first = notifier.when_invalidated(&*computed, first_cancel.clone());
    let second = notifier.when_invalidated(&*computed, CancellationToken::new());

    first_cancel.cancel();
    assert_eq!(first.await, Err(WaitCancelled));
    assert!(!computed.is_invalidated());

    computed.invalidate();
    assert_eq!(second.await, Ok(()));
}

#[tokio::test]
async fn test_already_invalidated_resolves_immediately() {
    test::setup();
    let notifier = InvalidationNotifier::default();
    let computed = test::pinned_forever();
    computed.invalidate();

    // even a cancelled token does not turn an invalidation into a cancellation
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(notifier.when_invalidated(&*computed, cancel).await, Ok(()));
    assert_eq!(computed.invalidation().total_subscriptions(), 0);
}
