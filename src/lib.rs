//! # EtherNet/IP Tag Client
//!
//! An async Rust client for reading, writing and watching tags on
//! Logix-family controllers over CIP on EtherNet/IP.
//!
//! A client owns one TCP session. Every tag operation is exactly one
//! request and one reply on that session; nothing is retried and the
//! session is never re-established behind the caller's back.
//!
//! ## Features
//!
//! - **Symbolic addressing**: `Counter`, `Motor.Speed`, `Program:Main.Recipe[3]`,
//!   and single bits of integers such as `Status.15`
//! - **Typed values**: BOOL, SINT..LINT, REAL, LREAL, STRING and structures
//! - **Batch operations**: per-item results, one failure never poisons the rest
//! - **Subscriptions**: per-tag polling with deadband change detection
//! - **Strict writes**: a value must match the tag's native type exactly
//! - **No panics**: all errors returned as `Result`
//!
//! ## Quick Start
//!
//! ```no_run
//! use enip::{Client, ClientConfig, TaggedValue};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect(ClientConfig::new("192.168.1.10")).await?;
//!
//!     let count = client.read("Counter").await?;
//!     println!("Counter = {}", count);
//!
//!     client.write("Setpoint", 1500i32).await?;
//!
//!     let handle = client
//!         .subscribe("Tank.Level", Duration::from_millis(250), 0.5)
//!         .await?;
//!     let mut updates = client.updates();
//!     while let Ok(event) = updates.recv().await {
//!         println!("{} = {:?} ({:?})", event.address, event.value, event.quality);
//!         # break;
//!     }
//!     client.unsubscribe(handle).await;
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Data Types
//!
//! | CIP type | Code | [`TaggedValue`] | Size |
//! |----------|------|-----------------|------|
//! | BOOL | 0xC1 | `Bool` | 1 |
//! | SINT | 0xC2 | `SignedInt(Sint)` | 1 |
//! | INT | 0xC3 | `SignedInt(Int)` | 2 |
//! | DINT | 0xC4 | `SignedInt(Dint)` | 4 |
//! | LINT | 0xC5 | `SignedInt(Lint)` | 8 |
//! | REAL | 0xCA | `Float(Real)` | 4 |
//! | LREAL | 0xCB | `Float(Lreal)` | 8 |
//! | STRING | 0x02A0 / 0x0FCE | `Text` | 88 |
//! | Structure | 0x02A0 / handle | `Composite` | per layout |
//!
//! Structures other than STRING are decoded once their definition has been
//! registered with [`Client::register_type`]:
//!
//! ```no_run
//! # use enip::{Client, ClientConfig, CompositeType, DataType, FloatWidth, IntWidth};
//! # async fn run(mut client: Client) -> enip::Result<()> {
//! client.register_type(
//!     CompositeType::new("Motor_UDT", 0x1234)
//!         .member("Running", DataType::Bool)
//!         .member("Speed", DataType::Float(FloatWidth::W32))
//!         .member("Faults", DataType::SignedInt(IntWidth::W32)),
//! );
//! client.write("Motor.Speed", 42.5f32).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```no_run
//! use enip::{Client, OperationError};
//!
//! # async fn run(client: Client) {
//! match client.read("Counter").await {
//!     Ok(value) => println!("Counter = {}", value),
//!     Err(OperationError::AddressNotFound { address, .. }) => println!("no tag {}", address),
//!     Err(OperationError::SessionLost) => println!("connection lost, reconnect"),
//!     Err(OperationError::Rejected { status, .. }) => {
//!         println!("controller rejected: {}", enip::cip_status_description(status));
//!     }
//!     Err(e) => println!("error: {}", e),
//! }
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate logs through [`tracing`]: session lifecycle at `info`, stale
//! replies and dispatch failures at `warn`, individual operations at
//! `debug`. Install any subscriber to see them.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
mod client;
pub mod codec;
mod command;
mod error;
mod executor;
mod header;
mod response;
mod session;
mod subscription;
mod transport;
mod value;

// Public re-exports
pub use address::{PathSegment, TagAddress};
pub use client::{Client, ClientConfig, Status, DEFAULT_EVENT_CAPACITY, DEFAULT_KEEPALIVE};
pub use codec::{TypeRegistry, WireType};
pub use command::{
    send_rr_data, ReadTagCommand, RoutePath, UnconnectedSend, WriteTagCommand,
    SERVICE_READ_TAG, SERVICE_WRITE_TAG,
};
pub use error::{
    cip_status_description, encapsulation_status_description, ConnectionError, DecodeError,
    OperationError, Result, TransportError,
};
pub use executor::{Executor, OperationStats, TagReader};
pub use header::{
    EncapsulationHeader, COMMAND_NOP, COMMAND_REGISTER_SESSION, COMMAND_SEND_RR_DATA,
    COMMAND_UNREGISTER_SESSION, ENCAPSULATION_HEADER_SIZE,
};
pub use response::{extract_cip, CipResponse};
pub use session::{Session, SessionState};
pub use subscription::{Dispatch, EngineHandle, Quality, SubscriptionHandle, UpdateEvent};
pub use transport::{TcpTransport, DEFAULT_ENIP_PORT, DEFAULT_TIMEOUT, MAX_ENCAPSULATION_LENGTH};
pub use value::{
    Composite, CompositeType, DataType, Float, FloatWidth, IntWidth, MemberDef, SignedInt,
    TaggedValue,
};
