//! Weight readings and connectivity state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

/// One weight value as reported by the balance.
///
/// `stable` is the instrument's own stability flag (`S` vs `D` status), not
/// the verdict of a [`StabilityDetector`](crate::StabilityDetector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Numeric weight value.
    pub value: f64,
    /// Unit token exactly as sent by the instrument (`g`, `kg`, `mg`, ...).
    pub unit: String,
    /// Instrument-reported stability.
    pub stable: bool,
}

impl Reading {
    /// Create a new reading.
    pub fn new(value: f64, unit: impl Into<String>, stable: bool) -> Self {
        Self {
            value,
            unit: unit.into(),
            stable,
        }
    }
}

/// Connectivity of the bridge to its instrument.
///
/// `Disabled` is terminal: it is decided at construction when no host is
/// configured. The other three states cycle under the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// No instrument configured, no connection will ever be attempted.
    Disabled,
    /// A connect attempt is in flight.
    Connecting,
    /// Socket open and usable.
    Connected,
    /// Link lost or connect failed, waiting for the next attempt.
    Disconnected,
}

impl ConnectivityState {
    /// Externally reported status string.
    ///
    /// Only three values are exposed; an in-flight attempt reads as
    /// `disconnected`.
    pub fn as_status_str(self) -> &'static str {
        match self {
            ConnectivityState::Disabled => "disabled",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Connecting | ConnectivityState::Disconnected => "disconnected",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectivityState::Disabled => 0,
            ConnectivityState::Connecting => 1,
            ConnectivityState::Connected => 2,
            ConnectivityState::Disconnected => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectivityState::Disabled,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Connected,
            _ => ConnectivityState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectivityState::Disabled => "disabled",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
        };
        write!(f, "{}", label)
    }
}

/// Shared connectivity state with lock-free reads.
///
/// Written by the connection and the supervisor, read by status queries and
/// the publisher without ever waiting on the exchange guard. Every
/// transition is also announced on a `watch` channel for callers that want
/// to wait for a state instead of sampling it.
#[derive(Debug)]
pub struct ConnectivityCell {
    raw: AtomicU8,
    changes: watch::Sender<ConnectivityState>,
}

impl ConnectivityCell {
    /// Create a cell holding `initial`.
    pub fn new(initial: ConnectivityState) -> Self {
        let (changes, _) = watch::channel(initial);
        Self {
            raw: AtomicU8::new(initial.to_u8()),
            changes,
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Overwrite the state, returning the previous one.
    ///
    /// A `Disabled` cell never changes.
    pub fn set(&self, next: ConnectivityState) -> ConnectivityState {
        let disabled = ConnectivityState::Disabled.to_u8();
        let result = self
            .raw
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != disabled).then_some(next.to_u8())
            });
        match result {
            Ok(previous) => {
                let previous = ConnectivityState::from_u8(previous);
                if previous != next {
                    self.changes.send_replace(next);
                }
                previous
            }
            Err(previous) => ConnectivityState::from_u8(previous),
        }
    }

    /// Receiver woken on every transition.
    ///
    /// Concurrent writers may publish out of order, so treat a wakeup as a
    /// prompt to re-read [`get`](Self::get) rather than as the state itself.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.changes.subscribe()
    }
}

impl Default for ConnectivityCell {
    fn default() -> Self {
        Self::new(ConnectivityState::Disconnected)
    }
}
