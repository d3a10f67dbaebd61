//! Unit tests for ConfigStore reload behaviour

use campus_gateway::config::{ConfigStore, GatewayConfig};
use campus_gateway::GatewayError;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ORIGINAL: &str = r#"
port: 9000
rate_limit: 777
services:
  users:
    url: http://localhost:9001
    path_prefix: /users
"#;

const CHANGED: &str = r#"
port: 9000
rate_limit: 5
load_balancer:
  strategy: weighted
services:
  users:
    url: http://localhost:9001
    path_prefix: /users
    weight: 4
"#;

fn write_with_mtime(path: &Path, content: &str, mtime: SystemTime) {
    std::fs::write(path, content).unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn test_unchanged_mtime_is_noop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, ORIGINAL).unwrap();

    let store = ConfigStore::load(&path).unwrap();
    let loaded_at = modified(&path);

    // new content, same mtime: must not be picked up
    write_with_mtime(&path, CHANGED, loaded_at);

    assert!(!store.reload().unwrap());
    assert_eq!(store.get().rate_limit, 777);
}

#[test]
fn test_changed_file_is_reloaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, ORIGINAL).unwrap();

    let store = ConfigStore::load(&path).unwrap();
    write_with_mtime(&path, CHANGED, modified(&path) + Duration::from_secs(5));

    assert!(store.reload().unwrap());
    let config = store.get();
    assert_eq!(config.rate_limit, 5);
    assert_eq!(config.services["users"].weight, 4);
    assert_eq!(config.load_balancer.strategy.as_str(), "weighted");
}

#[test]
fn test_invalid_file_keeps_previous_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, ORIGINAL).unwrap();

    let store = ConfigStore::load(&path).unwrap();
    let later = modified(&path) + Duration::from_secs(5);

    write_with_mtime(&path, "port: [not, a, port", later);
    let err = store.reload().unwrap_err();
    assert!(matches!(err, GatewayError::ConfigInvalid(_)));
    assert_eq!(store.get().rate_limit, 777);

    write_with_mtime(&path, "port: 0\n", later + Duration::from_secs(5));
    assert!(store.reload().is_err());
    assert_eq!(store.get().port, 9000);
}

#[test]
fn test_deleted_file_is_noop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, ORIGINAL).unwrap();

    let store = ConfigStore::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(!store.reload().unwrap());
    assert_eq!(store.get().rate_limit, 777);
}

#[test]
fn test_unset_fields_get_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.toml");
    std::fs::write(&path, "[services.users]\nurl = \"http://localhost:9001\"\n").unwrap();

    let config = ConfigStore::load(&path).unwrap().get();
    assert_eq!(config.port, 8080);
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.rate_limit, 1000);
    assert_eq!(config.load_balancer.check_interval, Duration::from_secs(30));
    assert_eq!(config.load_balancer.check_timeout, Duration::from_secs(5));
    assert_eq!(config.services["users"].weight, 1);
    assert_eq!(config.services["users"].health_check_path, "/health");
}

#[tokio::test]
async fn test_reload_task_notifies_watchers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, ORIGINAL).unwrap();

    let store = Arc::new(ConfigStore::load(&path).unwrap());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    store.add_watcher(move |config: &GatewayConfig| {
        if config.rate_limit == 5 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let token = CancellationToken::new();
    let task = store.spawn_reload_task(Duration::from_millis(20), token.clone());

    write_with_mtime(&path, CHANGED, modified(&path) + Duration::from_secs(5));

    for _ in 0..100 {
        if notified.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(store.get().rate_limit, 5);

    token.cancel();
    task.await.unwrap();
}
