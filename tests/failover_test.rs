/// Failover Controller Tests
///
/// Server selection, cooldowns, exhaustion and transparent resubscription
/// against in-process Electrum servers.
mod common;

use common::{controller, regtest_chain, test_config, unused_address, Behavior, MockElectrum};
use electrum_sync::{HealthState, ServerConfig, SubscriptionEvent, SyncError};
use std::time::Duration;

#[tokio::test]
async fn test_unreachable_server_is_skipped_during_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let healthy = MockElectrum::start(regtest_chain(3)).await;
    let dead = ServerConfig::plaintext(unused_address().await);

    let controller = controller(&[dead, healthy.server_config()], &config);
    controller.request("server.ping", Vec::new()).await.unwrap();

    let servers = controller.pool().list_servers().unwrap();
    assert_eq!(controller.pool().health(&servers[0]), Some(HealthState::Unreachable));
    assert_eq!(controller.pool().health(&servers[1]), Some(HealthState::Healthy));
    assert!(controller.cooldown_remaining(&servers[0]).is_some());
    assert_eq!(
        controller.current_server().await.unwrap().address,
        healthy.address
    );

    // The live connection is reused; the dead server is not retried.
    controller.request("server.ping", Vec::new()).await.unwrap();
    assert_eq!(healthy.request_count("server.ping"), 2);
    assert_eq!(healthy.connections(), 1);
}

#[tokio::test]
async fn test_all_servers_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let malformed = MockElectrum::start(regtest_chain(1)).await;
    malformed.set_behavior(Behavior::Malformed);
    let dead = ServerConfig::plaintext(unused_address().await);

    let controller = controller(&[malformed.server_config(), dead], &config);
    let err = controller.request("server.ping", Vec::new()).await.unwrap_err();
    assert_eq!(err, SyncError::AllServersExhausted(2));
    assert_eq!(err.to_user_error().kind, "allServersExhausted");

    // Both are cooling down, so an immediate retry fails without connecting.
    let attempts = malformed.connections();
    assert!(controller.request("server.ping", Vec::new()).await.is_err());
    assert_eq!(malformed.connections(), attempts);
}

#[tokio::test]
async fn test_hanging_server_fails_over() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let hanging = MockElectrum::start(regtest_chain(1)).await;
    hanging.set_behavior(Behavior::Hang);
    let healthy = MockElectrum::start(regtest_chain(1)).await;

    let controller = controller(&[hanging.server_config(), healthy.server_config()], &config);
    let tip = controller
        .request("blockchain.headers.subscribe", Vec::new())
        .await
        .unwrap();
    assert_eq!(tip["height"], 0);
    assert_eq!(hanging.request_count("server.version"), 1);
}

#[tokio::test]
async fn test_server_recovers_after_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let flaky = MockElectrum::start(regtest_chain(1)).await;
    flaky.set_behavior(Behavior::Malformed);

    let controller = controller(&[flaky.server_config()], &config);
    assert!(controller.request("server.ping", Vec::new()).await.is_err());

    flaky.set_behavior(Behavior::Normal);
    tokio::time::sleep(config.backoff(1) + Duration::from_millis(50)).await;
    controller.request("server.ping", Vec::new()).await.unwrap();
    let server = &controller.pool().list_servers().unwrap()[0];
    assert_eq!(controller.pool().health(server), Some(HealthState::Healthy));
    assert!(controller.cooldown_remaining(server).is_none());
}

#[tokio::test]
async fn test_banned_server_is_never_selected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let first = MockElectrum::start(regtest_chain(1)).await;
    let second = MockElectrum::start(regtest_chain(1)).await;

    let controller = controller(&[first.server_config(), second.server_config()], &config);
    let servers = controller.pool().list_servers().unwrap();
    controller.ban(&servers[0]);

    controller.request("server.ping", Vec::new()).await.unwrap();
    assert_eq!(first.connections(), 0);
    assert_eq!(second.request_count("server.ping"), 1);
}

#[tokio::test]
async fn test_subscription_resubscribes_after_server_switch() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let chain = regtest_chain(4);
    let first = MockElectrum::start(chain.clone()).await;
    let second = MockElectrum::start(chain).await;

    let controller = controller(&[first.server_config(), second.server_config()], &config);
    let mut subscription = controller.subscribe("blockchain.headers.subscribe", Vec::new());

    let event = subscription.next_event().await.unwrap();
    assert!(matches!(event, SubscriptionEvent::Subscribed(ref tip) if tip["height"] == 3));

    first.push_tip();
    let event = subscription.next_event().await.unwrap();
    assert!(matches!(event, SubscriptionEvent::Notification(_)));

    first.shutdown();
    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SubscriptionEvent::Resubscribed(ref tip) if tip["height"] == 3));
    assert_eq!(
        controller.current_server().await.unwrap().address,
        second.address
    );

    second.push_tip();
    let event = subscription.next_event().await.unwrap();
    match event {
        SubscriptionEvent::Notification(params) => assert_eq!(params[0]["height"], 3),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_subscription_keeps_connection_usable() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let server = MockElectrum::start(regtest_chain(2)).await;

    let controller = controller(&[server.server_config()], &config);
    let mut subscription = controller.subscribe("blockchain.headers.subscribe", Vec::new());
    assert!(subscription.next_event().await.is_some());
    drop(subscription);

    controller.request("server.ping", Vec::new()).await.unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_burst_beyond_pending_capacity_queues_on_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = electrum_sync::SyncConfig {
        max_pending_requests: 2,
        ..test_config(dir.path())
    };
    let server = MockElectrum::start(regtest_chain(1)).await;
    let controller = controller(&[server.server_config()], &config);

    let results = futures::future::join_all(
        (0..10).map(|_| controller.request("server.ping", Vec::new())),
    )
    .await;
    assert!(results.iter().all(Result::is_ok), "{:?}", results);

    let servers = controller.pool().list_servers().unwrap();
    assert_eq!(controller.pool().health(&servers[0]), Some(HealthState::Healthy));
    assert!(controller.cooldown_remaining(&servers[0]).is_none());
    assert_eq!(server.request_count("server.ping"), 10);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_error_reply_is_returned_without_failover() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let first = MockElectrum::start(regtest_chain(1)).await;
    let second = MockElectrum::start(regtest_chain(1)).await;
    let controller = controller(&[first.server_config(), second.server_config()], &config);
    controller.request("server.ping", Vec::new()).await.unwrap();

    let unknown = "11".repeat(32);
    let err = controller
        .request("blockchain.transaction.get", vec![serde_json::json!(unknown)])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::Rpc {
            code: -32600,
            message: "unknown transaction".into()
        }
    );
    assert_eq!(err.to_user_error().kind, "serverError");

    let servers = controller.pool().list_servers().unwrap();
    assert_eq!(controller.pool().health(&servers[0]), Some(HealthState::Healthy));
    assert!(controller.cooldown_remaining(&servers[0]).is_none());

    controller.request("server.ping", Vec::new()).await.unwrap();
    assert_eq!(first.connections(), 1);
    assert_eq!(first.request_count("server.ping"), 2);
    assert_eq!(second.connections(), 0);
}

#[tokio::test]
async fn test_concurrent_failures_on_one_connection_count_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let server = MockElectrum::start(regtest_chain(1)).await;
    let controller = controller(&[server.server_config()], &config);
    controller.request("server.ping", Vec::new()).await.unwrap();

    server.set_behavior(Behavior::Hang);
    let pings: Vec<_> = (0..5)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.request("server.ping", Vec::new()).await })
        })
        .collect();
    assert!(common::wait_until(Duration::from_secs(5), || server.request_count("server.ping") == 6).await);
    server.drop_connections();

    for ping in pings {
        assert!(ping.await.unwrap().is_err());
    }
    let servers = controller.pool().list_servers().unwrap();
    assert_eq!(controller.pool().health(&servers[0]), Some(HealthState::Unreachable));
    let remaining = controller.cooldown_remaining(&servers[0]).unwrap();
    assert!(remaining <= config.backoff(1), "cooldown {:?}", remaining);
}
