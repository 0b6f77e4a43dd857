//! End-to-end scenarios over a runtime with mock backends
//!
//! These tests drive the public surface the way an embedder would: discover,
//! acquire a session, run lifecycle operations, release. The backend is a
//! scripted mock driver, so every external effect is observable.

use std::sync::Arc;
use std::time::Duration;

use devicelab::{BootOptions, Config, DeviceState, Error, Orientation, Runtime};
use devicelab_core::device::{DeviceKind, Platform};
use devicelab_core::driver::DeviceSeed;
use devicelab_drivers::test_utils::MockDriver;
use tempfile::TempDir;

fn sim_seed(id: &str, name: &str) -> DeviceSeed {
    DeviceSeed::new(id, name, Platform::Ios, DeviceKind::Simulator)
        .with_sdk("iOS 17.2")
        .with_state(DeviceState::Shutdown)
}

fn instant_boot() -> BootOptions {
    BootOptions {
        attempts: 3,
        interval: Duration::from_millis(10),
        settle: Duration::ZERO,
    }
}

struct Lab {
    runtime: Runtime,
    driver: Arc<MockDriver>,
    _base: TempDir,
}

async fn lab_with(config: Config, seeds: Vec<DeviceSeed>) -> Lab {
    let base = TempDir::new().unwrap();
    let driver = Arc::new(MockDriver::ios_simulators(seeds));
    let runtime = Runtime::builder(Config {
        drivers: Vec::new(),
        ..config
    })
    .register_driver(driver.clone())
    .storage_base(base.path().to_path_buf())
    .build()
    .await
    .unwrap();

    Lab {
        runtime,
        driver,
        _base: base,
    }
}

async fn lab(seeds: Vec<DeviceSeed>) -> Lab {
    lab_with(Config::default(), seeds).await
}

#[tokio::test]
async fn scenario_happy_path_boot_install_shutdown() {
    let lab = lab(vec![sim_seed("UDID-A", "iPhone SE")]).await;

    let devices = lab.runtime.discover(true, false).await.unwrap();
    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.id(), "UDID-A");
    assert_eq!(device.state(), DeviceState::Shutdown);

    let token = device.start_session().await.unwrap();

    device.boot(Some(token.as_str()), instant_boot()).await.unwrap();
    assert_eq!(device.state(), DeviceState::Booted);

    let lock_path = device.record().local_storage_path.join(".lock");
    let lock_content = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(lock_content, format!("1.{}", std::process::id()));

    device.install(&token, "/tmp/app.ipa").await.unwrap();
    assert!(lab
        .driver
        .operations()
        .contains(&"install UDID-A /tmp/app.ipa".to_string()));

    device.shutdown(&token).await.unwrap();
    assert_eq!(device.state(), DeviceState::Shutdown);
    let lock_content = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(lock_content, format!("0.{}", std::process::id()));

    device.end_session(&token).await.unwrap();
    // The session is gone: a fresh one can start immediately
    let second = device.start_session().await.unwrap();
    assert_ne!(second, token);
}

#[tokio::test]
async fn scenario_session_expiry_rejects_operations() {
    let config = Config {
        device_session_timeout: 100,
        ..Config::default()
    };
    let lab = lab_with(config, vec![sim_seed("UDID-A", "iPhone SE")]).await;

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = &devices[0];
    let token = device.start_session().await.unwrap();
    device.boot(Some(token.as_str()), instant_boot()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = device.install(&token, "/tmp/app.ipa").await.unwrap_err();
    assert!(matches!(err, Error::InvalidSession { .. }));
}

#[tokio::test]
async fn scenario_cross_process_lock_and_stale_reclaim() {
    let lab = lab(vec![sim_seed("UDID-B", "iPhone 15")]).await;

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = &devices[0];
    let lock_path = device.record().local_storage_path.join(".lock");

    // Another live process (pid 1) holds the lock
    std::fs::write(&lock_path, "1.1").unwrap();
    let err = device.start_session().await.unwrap_err();
    assert!(matches!(err, Error::DeviceLocked { pid: 1, .. }));

    // The holder dies without unlocking; the next acquire reclaims it
    std::fs::write(&lock_path, "1.999999999").unwrap();
    let token = device.start_session().await.unwrap();
    let content = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(content, format!("1.{}", std::process::id()));

    device.end_session(&token).await.unwrap();
}

#[tokio::test]
async fn scenario_single_flight_discovery() {
    let lab = lab(vec![sim_seed("UDID-A", "iPhone SE")]).await;
    lab.driver.set_discover_delay(Duration::from_millis(100));

    let registry_a = lab.runtime.registry();
    let (a, b) = tokio::join!(
        registry_a.discover(true, false),
        registry_a.discover(true, false)
    );

    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(lab.driver.discover_calls(), 1, "one subprocess walk");
    let ids_a: Vec<String> = a.iter().map(|d| d.id()).collect();
    let ids_b: Vec<String> = b.iter().map(|d| d.id()).collect();
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn scenario_double_boot_guard() {
    let lab = lab(vec![sim_seed("UDID-C", "iPhone 15 Pro")]).await;
    lab.driver.set_boot_delay(Duration::from_millis(200));

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = devices[0].clone();

    let first = {
        let device = device.clone();
        tokio::spawn(async move { device.boot(None, instant_boot()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = device.boot(None, instant_boot()).await.unwrap_err();
    assert!(matches!(err, Error::DeviceNotReady { .. }));

    first.await.unwrap().unwrap();

    let boots = lab
        .driver
        .operations()
        .iter()
        .filter(|op| op.starts_with("boot"))
        .count();
    assert_eq!(boots, 1, "no second backend boot was spawned");
}

#[tokio::test]
async fn scenario_orientation_wrap() {
    let lab = lab(vec![sim_seed("UDID-A", "iPhone SE")]).await;

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = &devices[0];
    let token = device.start_session().await.unwrap();
    device.boot(Some(token.as_str()), instant_boot()).await.unwrap();
    assert_eq!(device.orientation(), Orientation::PORTRAIT);

    // rotateLeft from portrait wraps to landscape-left (index 3), then 2
    device.rotate_left(&token).await.unwrap();
    assert_eq!(device.orientation().index(), 3);
    device.rotate_left(&token).await.unwrap();
    assert_eq!(device.orientation().index(), 2);

    // Four rotateRight calls are a full cycle mod 4
    for _ in 0..4 {
        device.rotate_right(&token).await.unwrap();
    }
    assert_eq!(device.orientation().index(), 2);
}

#[tokio::test]
async fn scenario_rediscovery_sees_booted_device() {
    let lab = lab(vec![sim_seed("UDID-A", "iPhone SE")]).await;

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = &devices[0];
    device.boot(None, instant_boot()).await.unwrap();

    // Past the TTL, a new walk reconciles the booted state from the backend
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let devices = lab.runtime.discover(false, false).await.unwrap();
    assert_eq!(devices[0].state(), DeviceState::Booted);
}

#[tokio::test]
async fn scenario_queries_by_name_and_id() {
    let lab = lab(vec![
        sim_seed("UDID-A", "iPhone SE"),
        sim_seed("UDID-B", "iPhone SE"),
        sim_seed("UDID-C", "iPhone 15"),
    ])
    .await;

    lab.runtime.discover(true, false).await.unwrap();

    assert_eq!(lab.runtime.devices_with_name("iPhone SE").len(), 2);
    assert_eq!(
        lab.runtime.device_with_id("UDID-C").unwrap().name(),
        "iPhone 15"
    );
    assert!(lab.runtime.device_with_id("UDID-Z").is_none());
}

#[tokio::test]
async fn scenario_instrument_termination_event_reaches_runtime_subscribers() {
    let lab = lab(vec![sim_seed("UDID-A", "iPhone SE")]).await;
    let mut events = lab.runtime.subscribe_events();

    let devices = lab.runtime.discover(true, false).await.unwrap();
    let device = &devices[0];
    let token = device.start_session().await.unwrap();
    device.boot(Some(token.as_str()), instant_boot()).await.unwrap();

    device.start_instrument(&token, "cpu-profiler").await.unwrap();
    lab.driver.instruments()[0].complete(Some(137));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event should arrive")
        .unwrap();
    assert_eq!(event.name(), "testing-sandbox-terminated");
}
