//! MT-SICS balance driver for the balance bridge.
//!
//! This crate owns everything that talks to the instrument:
//! - [`codec`]: MT-SICS command encoding and response decoding
//! - [`connection`]: one socket, one exchange at a time
//! - [`supervisor`]: reconnect loop with capped exponential backoff
//! - [`bridge`]: the facade the stream server and CLI call
//! - [`sim`]: a simulated balance for tests and local development
//!
//! # Usage
//!
//! ```rust,ignore
//! use bridge_core::BridgeConfig;
//! use bridge_driver_mtsics::Bridge;
//!
//! let config = BridgeConfig::load()?;
//! let bridge = std::sync::Arc::new(Bridge::start(&config));
//! let reading = bridge.read_weight().await?;
//! ```

pub mod bridge;
pub mod codec;
pub mod connection;
pub mod sim;
pub mod supervisor;

pub use bridge::Bridge;
pub use codec::{decode_acknowledgement, decode_response, encode_command, Command};
pub use connection::InstrumentConnection;
pub use sim::{SimConnector, SimulatedBalance};
pub use supervisor::{Backoff, ReconnectPolicy};
