//! Example: reading and writing tags
//!
//! Run with: cargo run --example simple_read -- 192.168.1.10
//!
//! This example demonstrates:
//! - Connecting with a custom timeout
//! - Reading single tags, program-scoped tags and array elements
//! - Batch reads with per-item results
//! - Writing values of the tag's exact type
//! - Decoding a user-defined structure

use std::time::Duration;

use enip::{
    Client, ClientConfig, CompositeType, DataType, FloatWidth, IntWidth, OperationError,
    TaggedValue,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = std::env::args().nth(1).unwrap_or_else(|| "192.168.1.10".to_string());

    // =========================================================================
    // Connect
    // =========================================================================

    let config = ClientConfig::new(&address).with_timeout(Duration::from_secs(2));
    let mut client = Client::connect(config).await?;
    println!("Connected: {:?}\n", client.status());

    // =========================================================================
    // Single reads
    // =========================================================================

    println!("=== Reading Tags ===\n");

    let counter = client.read("Counter").await?;
    println!("Counter            = {} ({})", counter, counter.type_name());

    match client.read("Program:MainProgram.State").await {
        Ok(value) => println!("MainProgram.State  = {}", value),
        Err(OperationError::AddressNotFound { reason, .. }) => {
            println!("MainProgram.State  not found: {}", reason)
        }
        Err(e) => return Err(e.into()),
    }

    // =========================================================================
    // Batch reads
    // =========================================================================

    println!("\n=== Batch Read ===\n");

    let tags = ["Recipe[0]", "Recipe[1]", "Recipe[2]", "NoSuchTag"];
    for (tag, result) in tags.iter().zip(client.read_batch(tags).await) {
        match result {
            Ok(value) => println!("{:<12} = {}", tag, value),
            Err(e) => println!("{:<12} ! {}", tag, e),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    println!("\n=== Writing Tags ===\n");

    // The value must match the tag's type exactly: a DINT takes an i32.
    if let Some(count) = counter.as_i64() {
        client.write("Counter", TaggedValue::from(count as i32 + 1)).await?;
        println!("Counter            = {}", client.read("Counter").await?);
    }

    // =========================================================================
    // Structures
    // =========================================================================

    println!("\n=== Structures ===\n");

    client.register_type(
        CompositeType::new("Motor_UDT", 0x1234)
            .member("Running", DataType::Bool)
            .member("Speed", DataType::Float(FloatWidth::W32))
            .member("Faults", DataType::SignedInt(IntWidth::W32)),
    );

    match client.read("Motor").await {
        Ok(motor) => {
            println!("Motor              = {}", motor);
            client.write("Motor.Speed", 1200.0f32).await?;
            println!("Motor.Speed        = {}", client.read("Motor.Speed").await?);
        }
        Err(e) => println!("Motor              ! {}", e),
    }

    client.disconnect().await;
    Ok(())
}
