//! Example: Streaming Characteristic Notifications
//!
//! This example connects to a peripheral, prints its GATT profile and
//! streams notifications from one characteristic until Ctrl-C.
//!
//! Run with:
//! `cargo run --example stream_notifications -- <ADDRESS> <SERVICE> <CHARACTERISTIC> [MODE] [RATE_MS]`
//!
//! MODE is `every_update`, `batched` (default) or `aggregated`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use blim_core::btle::BtleplugAdapter;
use blim_core::{
    ConnectOptions, Connection, ConnectionEvent, RecordPayload, StreamMode, SubscribeTarget,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (RUST_LOG=blim_core=debug for engine details)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <ADDRESS> <SERVICE> <CHARACTERISTIC> [MODE] [RATE_MS]", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} AA:BB:CC:DD:EE:FF 180d 2a37 batched 250", args[0]);
        std::process::exit(1);
    }
    let address = &args[1];
    let target = SubscribeTarget::service(&args[2]).characteristic(&args[3]);
    let mode: StreamMode = args
        .get(4)
        .map(|m| m.parse())
        .transpose()?
        .unwrap_or(StreamMode::Batched);
    let rate = Duration::from_millis(args.get(5).map(|r| r.parse()).transpose()?.unwrap_or(0));

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let connection = Connection::new(adapter);

    let mut events = connection.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::LinkLost { address, reason } => {
                    eprintln!("!! {address}: {reason}");
                }
                other => println!("event: {}", serde_json::to_string(&other).unwrap_or_default()),
            }
        }
    });

    println!("Connecting to {}...", address);
    connection.connect(address, ConnectOptions::default()).await?;

    for service in connection.services() {
        println!("{} {}", service.uuid(), service.known_name().unwrap_or(""));
        for characteristic in service.characteristics() {
            println!("  {} [{}]", characteristic.uuid(), characteristic.properties());
            for descriptor in characteristic.descriptors() {
                match descriptor.parsed() {
                    Ok(Some(value)) => println!("    {} = {:?}", descriptor.uuid(), value),
                    Ok(None) => println!("    {}", descriptor.uuid()),
                    Err(err) => println!("    {} ({})", descriptor.uuid(), err),
                }
            }
        }
    }

    println!();
    println!("Streaming ({mode}), Ctrl-C to stop");
    connection
        .subscribe(&[target], mode, rate, |record| match &record.payload {
            RecordPayload::Values(values) => {
                for (uuid, data) in values {
                    println!("#{} {} {:02x?} {:?}", record.seq, uuid, &data[..], record.flags);
                }
            }
            RecordPayload::BatchValues(batches) => {
                for (uuid, batch) in batches {
                    println!("#{} {} {} values {:?}", record.seq, uuid, batch.len(), record.flags);
                }
            }
        })
        .await?;

    tokio::signal::ctrl_c().await?;
    connection.disconnect().await?;
    println!("Disconnected ({:?})", connection.pool_stats());

    Ok(())
}
