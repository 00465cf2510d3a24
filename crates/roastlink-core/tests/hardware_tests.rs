//! Hardware integration tests for roastlink-core
//!
//! These tests require a Bluetooth adapter and a powered-on analyzer:
//! ```
//! cargo test --package roastlink-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Set `ROASTLINK_DEVICE` to the analyzer's identifier (MAC address, or the
//! CoreBluetooth UUID on macOS) to skip discovery.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use roastlink_core::{
    BtleplugAdapter, ConnectionConfig, ConnectionManager, DeviceInfoReader, MeasurementSession,
    SessionConfig,
};
use roastlink_types::{CoffeeType, ConnectionState};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

async fn manager() -> ConnectionManager {
    let adapter = BtleplugAdapter::new()
        .await
        .expect("Bluetooth adapter should be available");
    ConnectionManager::new(Arc::new(adapter), ConnectionConfig::default())
        .expect("default config is valid")
}

/// Configured device id, or the strongest analyzer found by a scan.
async fn find_device(manager: &ConnectionManager) -> Option<String> {
    if let Ok(id) = env::var("ROASTLINK_DEVICE") {
        return Some(id);
    }
    let report = manager.scan(Duration::from_secs(8)).await.ok()?;
    if let Some(diagnostic) = &report.diagnostic {
        println!("Scan diagnostic: {}", diagnostic);
    }
    report.devices.first().map(|d| d.id.clone())
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_discovers_analyzers() {
    let manager = manager().await;
    let report = timeout(BLE_TIMEOUT, manager.scan(Duration::from_secs(8)))
        .await
        .expect("scan should finish")
        .expect("scan should start");

    println!("Found {} analyzers", report.devices.len());
    for device in &report.devices {
        println!("  {} [{}] rssi={:?}", device.display_name(), device.id, device.rssi);
    }
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_read_info_disconnect() {
    let manager = manager().await;
    let Some(device_id) = find_device(&manager).await else {
        println!("No analyzer found, skipping");
        return;
    };

    manager.connect(&device_id).await.expect("connect");
    assert!(manager.state().is_connected());

    let report = DeviceInfoReader::new(manager.clone())
        .read_if_needed()
        .await
        .expect("info read");
    println!("Device info: {:?}", report.info);
    for (field, err) in &report.failures {
        println!("  {} failed: {}", field, err);
    }

    manager.disconnect().await.expect("disconnect");
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test]
#[ignore = "requires BLE hardware and a sample in the analyzer - slow test"]
async fn test_measure_auto() {
    let manager = manager().await;
    let Some(device_id) = find_device(&manager).await else {
        println!("No analyzer found, skipping");
        return;
    };
    manager.connect(&device_id).await.expect("connect");

    let session = MeasurementSession::new(manager.clone(), SessionConfig::default());
    match session.measure(CoffeeType::Auto, None).await {
        Ok(state) => println!("Measurement complete: {:?}", state.reading),
        Err(e) => println!("Measurement ended: {}", e),
    }
    println!("{}", manager.debug_log().export_text());

    manager.disconnect().await.expect("disconnect");
}
