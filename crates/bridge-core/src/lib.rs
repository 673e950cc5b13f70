//! Core types for the balance bridge.
//!
//! This crate holds everything the driver, the stream server and the binary
//! share without depending on each other:
//!
//! - [`capabilities`]: traits the stream server drives instruments through
//! - [`error`]: the error hierarchy (connection, protocol, configuration)
//! - [`reading`]: weight readings and the connectivity state cell
//! - [`stability`]: the consumer-side rolling stability detector
//! - [`io`]: transport abstraction for the instrument byte stream
//! - [`config`]: layered configuration (defaults, TOML file, environment)

pub mod capabilities;
pub mod config;
pub mod error;
pub mod io;
pub mod reading;
pub mod stability;

pub use capabilities::{BalanceControl, WeightSource};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, ConnectionError, ProtocolError};
pub use reading::{ConnectivityCell, ConnectivityState, Reading};
pub use stability::StabilityDetector;
