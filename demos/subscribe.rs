//! Example: watching tags for changes
//!
//! Run with: cargo run --example subscribe -- 192.168.1.10
//!
//! Subscribes to a few tags and prints every reported change for 30
//! seconds. Numeric tags are reported when they move by at least the
//! threshold; other tags on any change.

use std::time::Duration;

use enip::{Client, ClientConfig, Quality};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = std::env::args().nth(1).unwrap_or_else(|| "192.168.1.10".to_string());
    let config = ClientConfig::new(&address).with_keepalive(Duration::from_secs(10));
    let mut client = Client::connect(config).await?;

    let mut updates = client.updates();

    client.subscribe("Tank.Level", Duration::from_millis(250), 0.5).await?;
    client.subscribe("Pump.Running", Duration::from_millis(100), 0.0).await?;
    let alarms = client.subscribe("AlarmCount", Duration::from_secs(1), 1.0).await?;
    println!("{} subscriptions active\n", client.status().active_subscriptions);

    let watch = async {
        loop {
            match updates.recv().await {
                Ok(event) => match event.quality {
                    Quality::Good => {
                        if let Some(value) = &event.value {
                            println!("{} {:<14} = {}", event.handle, event.address, value);
                        }
                    }
                    Quality::Bad => {
                        if let Some(error) = &event.error {
                            println!("{} {:<14} ! {}", event.handle, event.address, error);
                        }
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    println!("missed {} events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(30), watch).await;

    client.unsubscribe(alarms).await;
    client.disconnect().await;
    Ok(())
}
