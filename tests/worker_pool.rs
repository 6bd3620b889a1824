//! Elastic publish worker pool behavior.

mod common;

use std::time::Duration;

use common::*;
use ua_client::{Error, SessionOptions, StatusCode, SubscriptionManager};

#[tokio::test]
async fn pool_size_follows_created_subscriptions_within_bounds() {
    init_tracing();
    let services = MockServices::new();
    let options = SessionOptions {
        min_publish_worker_count: 2,
        max_publish_worker_count: 3,
        ..Default::default()
    };
    let manager = SubscriptionManager::new(services.clone(), &options);
    manager.resume();

    // nothing created, nothing published
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.diagnostics().publish_worker_count, 0);

    let handler = RecordingHandler::new();
    let first = manager.add(Default::default(), handler.clone());
    first.create().await.unwrap();
    assert!(
        wait_until(
            || manager.diagnostics().publish_worker_count == 2,
            Duration::from_secs(2),
        )
        .await,
        "one created subscription still gets the minimum pool"
    );

    let mut rest = Vec::new();
    for _ in 0..4 {
        let subscription = manager.add(Default::default(), handler.clone());
        subscription.create().await.unwrap();
        rest.push(subscription);
    }
    assert!(
        wait_until(
            || manager.diagnostics().publish_worker_count == 3,
            Duration::from_secs(2),
        )
        .await,
        "five created subscriptions are capped at the maximum"
    );
    assert!(manager.diagnostics().publish_worker_count <= 3);

    manager.remove(&first).await.unwrap();
    for subscription in &rest {
        manager.remove(subscription).await.unwrap();
    }
    assert!(
        wait_until(
            || manager.diagnostics().publish_worker_count == 0,
            Duration::from_secs(2),
        )
        .await,
        "no created subscriptions, no workers"
    );
    manager.close().await;
}

#[tokio::test]
async fn too_many_publish_requests_lowers_the_worker_limit() {
    init_tracing();
    let services = MockServices::new();
    let options = SessionOptions {
        min_publish_worker_count: 1,
        max_publish_worker_count: 3,
        ..Default::default()
    };
    let manager = SubscriptionManager::new(services.clone(), &options);
    let handler = RecordingHandler::new();
    for _ in 0..3 {
        let subscription = manager.add(Default::default(), handler.clone());
        subscription.create().await.unwrap();
    }
    manager.resume();
    assert!(
        wait_until(
            || manager.diagnostics().publish_worker_count == 3,
            Duration::from_secs(2),
        )
        .await
    );

    services.queue_publish(Err(Error::Service(
        StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS,
    )));
    assert!(
        wait_until(
            || manager.diagnostics().max_publish_workers == 2,
            Duration::from_secs(2),
        )
        .await,
        "limit drops by one after the server complains"
    );
    assert!(
        wait_until(
            || manager.diagnostics().publish_worker_count == 2,
            Duration::from_secs(2),
        )
        .await,
        "pool shrinks to the new limit"
    );
    assert!(manager.diagnostics().bad_publish_requests >= 1);
    manager.close().await;
}

#[tokio::test]
async fn server_busy_throttles_without_losing_the_worker() {
    init_tracing();
    let services = MockServices::new();
    let options = SessionOptions {
        min_publish_worker_count: 1,
        max_publish_worker_count: 1,
        ..Default::default()
    };
    let manager = SubscriptionManager::new(services.clone(), &options);
    let handler = RecordingHandler::new();
    let subscription = manager.add(Default::default(), handler.clone());
    subscription.create().await.unwrap();
    let id = subscription.id();
    manager.resume();

    services.queue_publish(Err(Error::Service(StatusCode::BAD_TCP_SERVER_TOO_BUSY)));
    services.queue_publish(Ok(publish_response(id, data_message(1), &[])));

    assert!(
        handler.wait_dispatched(1, Duration::from_secs(3)).await,
        "the worker backed off and carried on"
    );
    assert!(manager.diagnostics().bad_publish_requests >= 1);
    assert_eq!(manager.diagnostics().publish_worker_count, 1);
    manager.close().await;
}

#[tokio::test]
async fn failed_publish_requeues_its_acknowledgements() {
    init_tracing();
    let services = MockServices::new();
    let options = SessionOptions {
        min_publish_worker_count: 1,
        max_publish_worker_count: 1,
        ..Default::default()
    };
    let manager = SubscriptionManager::new(services.clone(), &options);
    let handler = RecordingHandler::new();
    let subscription = manager.add(Default::default(), handler.clone());
    subscription.create().await.unwrap();
    let id = subscription.id();
    manager.resume();

    services.queue_publish(Ok(publish_response(id, data_message(1), &[])));
    assert!(handler.wait_dispatched(1, Duration::from_secs(2)).await);

    // the publish carrying ack 1 fails; the ack must come back around
    services.queue_publish(Err(Error::Timeout));
    for _ in 0..5 {
        services.queue_publish(Ok(keep_alive_response(id, 2, &[])));
    }
    assert!(
        wait_until(
            || services.acked_sequence_numbers(id).iter().filter(|&&s| s == 1).count() >= 2,
            Duration::from_secs(3),
        )
        .await,
        "ack for sequence 1 was retried after the failed publish"
    );
    manager.close().await;
}
