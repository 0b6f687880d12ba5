//! Hardware integration tests for blim-core
//!
//! These tests require a real BLE peripheral and should be run with:
//! ```
//! cargo test --package blim-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the peripheral via environment variables:
//! - `BLIM_DEVICE`: address (or CoreBluetooth UUID on macOS) to connect to
//! - `BLIM_SERVICE`: service to stream from (default: `180f`, Battery)
//! - `BLIM_CHARACTERISTIC`: characteristic to stream (default: `2a19`)
//!
//! Example:
//! ```
//! BLIM_DEVICE="AA:BB:CC:DD:EE:FF" cargo test --package blim-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use blim_core::btle::BtleplugAdapter;
use blim_core::{ConnectOptions, Connection, Device, StreamMode, SubscribeTarget};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn get_device() -> Option<String> {
    env::var("BLIM_DEVICE").ok().filter(|s| !s.is_empty())
}

fn get_target() -> (String, String) {
    (
        env::var("BLIM_SERVICE").unwrap_or_else(|_| "180f".to_string()),
        env::var("BLIM_CHARACTERISTIC").unwrap_or_else(|_| "2a19".to_string()),
    )
}

async fn adapter() -> Arc<BtleplugAdapter> {
    match BtleplugAdapter::new().await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => panic!("No Bluetooth adapter: {}", e),
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_and_list_services() {
    let Some(address) = get_device() else {
        println!("BLIM_DEVICE not set, skipping");
        return;
    };

    let connection = Connection::new(adapter().await);
    let result = timeout(
        BLE_TIMEOUT,
        connection.connect(&address, ConnectOptions::default()),
    )
    .await;

    match result {
        Ok(Ok(())) => {
            for service in connection.services() {
                println!(
                    "service {} ({})",
                    service.uuid(),
                    service.known_name().unwrap_or("Unknown")
                );
                for characteristic in service.characteristics() {
                    println!(
                        "  - {} [{}] {} descriptors",
                        characteristic.uuid(),
                        characteristic.properties(),
                        characteristic.descriptors().len()
                    );
                }
            }
            assert!(!connection.services().is_empty());
            connection.disconnect().await.expect("disconnect failed");
        }
        Ok(Err(e)) => panic!("Connect failed: {}", e),
        Err(_) => panic!("Connect timed out after {:?}", BLE_TIMEOUT),
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_stream_notifications() {
    let Some(address) = get_device() else {
        println!("BLIM_DEVICE not set, skipping");
        return;
    };
    let (service, characteristic) = get_target();

    let connection = Connection::new(adapter().await);
    connection
        .connect(&address, ConnectOptions::default())
        .await
        .expect("connect failed");

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let id = connection
        .subscribe(
            &[SubscribeTarget::service(service).characteristic(characteristic)],
            StreamMode::Batched,
            Duration::from_millis(500),
            move |record| {
                counter.fetch_add(1, Ordering::SeqCst);
                println!("seq={} flags={:?} {:?}", record.seq, record.flags, record.payload);
            },
        )
        .await
        .expect("subscribe failed");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(connection.cancel_subscription(id).await);
    connection.disconnect().await.expect("disconnect failed");
    println!("received {} records", received.load(Ordering::SeqCst));
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_device_name_and_reconnect() {
    let Some(address) = get_device() else {
        println!("BLIM_DEVICE not set, skipping");
        return;
    };
    let adapter = adapter().await;
    let mut device = Device::new(address);

    for attempt in 1..=2 {
        device
            .connect(adapter.clone(), ConnectOptions::default())
            .await
            .unwrap_or_else(|e| panic!("connect attempt {attempt} failed: {e}"));
        println!("attempt {attempt}: name = {:?}", device.name());
        assert!(device.is_connected());
        device.disconnect().await.expect("disconnect failed");
        assert!(!device.is_connected());
    }
}
