//! Registry watch subscriptions

use campus_gateway::gateway::registry::WATCH_BUFFER;
use campus_gateway::{LoadBalancer, ServiceInstance, ServiceRegistry, Strategy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry() -> Arc<ServiceRegistry> {
    let lb = Arc::new(LoadBalancer::new(Strategy::RoundRobin));
    Arc::new(ServiceRegistry::new(lb, Duration::from_secs(1), CancellationToken::new()).unwrap())
}

fn instance(id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "users", format!("http://localhost:{}", port))
}

#[tokio::test]
async fn test_watch_receives_current_snapshot_immediately() {
    let registry = registry();
    registry.register(instance("users-1", 9001)).unwrap();

    let mut rx = registry.watch("users", CancellationToken::new());
    let snapshot = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "users-1");
}

#[tokio::test]
async fn test_watch_unknown_service_starts_empty() {
    let registry = registry();
    let mut rx = registry.watch("nobody", CancellationToken::new());
    let snapshot = rx.recv().await.unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_watch_sees_membership_changes() {
    let registry = registry();
    let mut rx = registry.watch("users", CancellationToken::new());
    assert!(rx.recv().await.unwrap().is_empty());

    registry.register(instance("users-1", 9001)).unwrap();
    assert_eq!(rx.recv().await.unwrap().len(), 1);

    registry.register(instance("users-2", 9002)).unwrap();
    assert_eq!(rx.recv().await.unwrap().len(), 2);

    registry.unregister("users-1").unwrap();
    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "users-2");
}

#[tokio::test]
async fn test_identical_reregistration_is_silent() {
    let registry = registry();
    registry.register(instance("users-1", 9001)).unwrap();

    let mut rx = registry.watch("users", CancellationToken::new());
    rx.recv().await.unwrap();

    registry.register(instance("users-1", 9001)).unwrap();
    assert!(rx.try_recv().is_err());

    registry.register(instance("users-1", 9001).with_weight(7)).unwrap();
    assert_eq!(rx.recv().await.unwrap()[0].weight, 7);
}

#[tokio::test]
async fn test_slow_watcher_drops_snapshots() {
    let registry = registry();
    let mut rx = registry.watch("users", CancellationToken::new());

    for i in 0..(WATCH_BUFFER as u16 * 3) {
        registry
            .register(instance(&format!("users-{}", i), 9000 + i))
            .unwrap();
    }

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, WATCH_BUFFER);
    assert_eq!(registry.watcher_count("users"), 1);
}

#[tokio::test]
async fn test_cancelled_watch_closes_channel() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let mut rx = registry.watch("users", cancel.clone());
    rx.recv().await.unwrap();

    cancel.cancel();
    let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(registry.watcher_count("users"), 0);
}

#[tokio::test]
async fn test_dropped_subscription_is_removed() {
    let registry = registry();
    let rx = registry.watch("users", CancellationToken::new());
    assert_eq!(registry.watcher_count("users"), 1);

    drop(rx);
    for _ in 0..100 {
        if registry.watcher_count("users") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.watcher_count("users"), 0);
}

#[tokio::test]
async fn test_close_ends_all_subscriptions() {
    let registry = registry();
    let mut users = registry.watch("users", CancellationToken::new());
    let mut grades = registry.watch("grades", CancellationToken::new());
    users.recv().await.unwrap();
    grades.recv().await.unwrap();

    registry.close();

    assert!(timeout(Duration::from_secs(1), users.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_secs(1), grades.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_health_transition_notifies_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = registry();
    registry
        .register(ServiceInstance::new("users-1", "users", server.uri()))
        .unwrap();

    let mut rx = registry.watch("users", CancellationToken::new());
    assert!(rx.recv().await.unwrap()[0].healthy);

    registry.check_all().await;
    let snapshot = rx.recv().await.unwrap();
    assert!(!snapshot[0].healthy);
    assert_eq!(snapshot[0].failure_count, 1);

    // still failing: counters move, no new snapshot
    registry.check_all().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(registry.instance("users", "users-1").unwrap().failure_count, 2);
}

#[tokio::test]
async fn test_health_loop_stops_on_close() {
    let registry = registry();
    let handle = registry.spawn_health_checks(Duration::from_millis(20));
    registry.close();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reannounce_during_probe_keeps_new_url_in_rotation() {
    let old = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(300)))
        .mount(&old)
        .await;

    let new = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&new)
        .await;

    let registry = registry();
    registry
        .register(ServiceInstance::new("users-1", "users", old.uri()))
        .unwrap();

    let checking = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.check_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry
        .register(ServiceInstance::new("users-1", "users", new.uri()))
        .unwrap();
    checking.await.unwrap();

    let instance = registry.instance("users", "users-1").unwrap();
    assert_eq!(instance.url, new.uri());
    assert!(instance.healthy);
    assert_eq!(instance.failure_count, 0);
    assert!(registry.load_balancer().select("users").is_ok());
}
