//! Scan for nearby peripherals, connect to the first one and talk to it.
//!
//! Run with: cargo run --example scan_and_connect --features btleplug

use ble_central::{CentralConfig, CentralManager, GattOperation, Result};
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

/// Sample peripheral service.
const ROBOT_SERVICE_UUID: Uuid = Uuid::from_u128(0x00726f62_6f74_7061_6a61_6d61732e6361);
/// Command characteristic (write).
const ROBOT_TX_UUID: Uuid = Uuid::from_u128(0x01726f62_6f74_7061_6a61_6d61732e6361);
/// Status characteristic (read/notify).
const ROBOT_RX_UUID: Uuid = Uuid::from_u128(0x02726f62_6f74_7061_6a61_6d61732e6361);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=debug".parse().unwrap()),
        )
        .init();

    let central = CentralManager::with_btleplug(CentralConfig::default()).await?;
    println!("Radio: {}", central.radio_state());

    let _radio_handle = central.radio().on_state_changed(|state| {
        println!("Radio state changed: {}", state);
    });

    println!("Scanning for 10 seconds...\n");
    let devices = central.scan_for(Duration::from_secs(10)).await?;

    for device in &devices {
        println!(
            "  {} ({}) RSSI: {:?} dBm",
            device.display_name(),
            device.id,
            device.rssi
        );
    }

    let Some(device) = devices.first() else {
        println!("\nNo devices found.");
        return Ok(());
    };

    println!("\nConnecting to {}...", device.display_name());
    let session = central.session_for(device);
    let _connection_handle = session.on_connection_changed(|event| {
        println!("Connection: {} ({:?})", event.state, event.reason);
    });
    session.connect().await?;

    for (service, characteristics) in session.discover_all().await? {
        println!("Service {}", service.uuid);
        for characteristic in characteristics {
            println!(
                "  Characteristic {} read={} write={} notify={}",
                characteristic.uuid,
                characteristic.properties.supports(GattOperation::Read),
                characteristic.properties.supports(GattOperation::Write),
                characteristic.properties.can_subscribe(),
            );
        }
    }

    if session
        .characteristic(&ROBOT_SERVICE_UUID, &ROBOT_RX_UUID)
        .is_ok()
    {
        let mut status = session.subscribe(ROBOT_SERVICE_UUID, ROBOT_RX_UUID).await?;

        let value = session.read(ROBOT_SERVICE_UUID, ROBOT_RX_UUID).await?;
        println!("\nStatus: {:02x?}", value.as_ref());

        session
            .write(ROBOT_SERVICE_UUID, ROBOT_TX_UUID, vec![0x01], true)
            .await?;

        println!("Waiting for notifications (5 seconds)...");
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(value) = status.next() => println!("  Notification: {:02x?}", value.as_ref()),
                _ = &mut deadline => break,
            }
        }

        session.unsubscribe(ROBOT_SERVICE_UUID, ROBOT_RX_UUID).await?;
    } else {
        println!("\nDevice does not expose the sample robot service.");
    }

    central.shutdown().await?;
    println!("Done.");

    Ok(())
}
