//! Capability traits for weighing instruments.
//!
//! The stream publisher and the HTTP layer only see these traits, so they can
//! be driven by the real MT-SICS bridge or by a scripted source in tests.

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::reading::{ConnectivityState, Reading};

/// Capability: Weight Readout
///
/// # Contract
/// - `read_weight()` performs exactly one exchange with the instrument
/// - Concurrent callers are serialized, never interleaved on the wire
/// - Fails with [`BridgeError::NotConfigured`](crate::BridgeError::NotConfigured)
///   when no instrument is configured
/// - `connectivity()` never blocks on an in-flight exchange
#[async_trait]
pub trait WeightSource: Send + Sync {
    /// Read the current weight once.
    async fn read_weight(&self) -> BridgeResult<Reading>;

    /// Current connectivity state.
    fn connectivity(&self) -> ConnectivityState;
}

/// Capability: Zero and Tare
#[async_trait]
pub trait BalanceControl: Send + Sync {
    /// Zero the balance.
    async fn zero(&self) -> BridgeResult<()>;

    /// Tare the balance, returning the stored tare weight.
    async fn tare(&self) -> BridgeResult<Reading>;
}
