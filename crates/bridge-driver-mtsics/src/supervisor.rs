//! Reconnect supervisor.
//!
//! Keeps an [`InstrumentConnection`] up for the lifetime of the bridge:
//!
//! ```text
//!              connect ok
//! Connecting ─────────────▶ Connected
//!     ▲   │ connect failed       │ exchange dropped the socket
//!     │   ▼                      ▼
//!     └─── Disconnected ◀────────┘
//!      after backoff delay
//! ```
//!
//! The delay starts at `initial_delay`, grows by `multiplier` per consecutive
//! failure, is capped at `max_delay` and resets after every successful
//! connect. The supervisor never returns errors to anyone; it only changes
//! the shared connectivity state and logs.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::config::ReconnectConfig;
use bridge_core::ConnectivityState;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::InstrumentConnection;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure and after every link loss.
    pub initial_delay: Duration,
    /// Upper bound.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `failures` (1-based).
    ///
    /// Formula: `initial_delay * multiplier^(failures - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Consecutive-failure counter over a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    /// Fresh backoff; the first delay will be `initial_delay`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Record a failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for_attempt(self.failures)
    }

    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the supervisor and wait for it to close the connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "reconnect supervisor task failed");
        }
    }
}

/// Spawn the supervisor loop for `connection`.
pub fn spawn(connection: Arc<InstrumentConnection>, policy: ReconnectPolicy) -> SupervisorHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(connection, policy, shutdown_rx));
    SupervisorHandle { shutdown, task }
}

async fn run(
    connection: Arc<InstrumentConnection>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let state = connection.state_handle();
    let link_lost = connection.link_lost();
    let mut backoff = Backoff::new(policy);

    tracing::info!(endpoint = %connection.endpoint(), "reconnect supervisor started");

    'supervise: loop {
        state.set(ConnectivityState::Connecting);
        let attempt = backoff.failures() + 1;

        let connected = tokio::select! {
            result = connection.connect() => result,
            _ = shutdown.changed() => break 'supervise,
        };

        match connected {
            Ok(()) => {
                backoff.reset();
                // Stale wakeups are possible; trust the state, not the signal
                loop {
                    tokio::select! {
                        _ = link_lost.notified() => {
                            if !connection.is_connected() {
                                break;
                            }
                        }
                        _ = shutdown.changed() => break 'supervise,
                    }
                }
            }
            Err(e) => {
                state.set(ConnectivityState::Disconnected);
                tracing::warn!(
                    endpoint = %connection.endpoint(),
                    attempt,
                    error = %e,
                    "connect attempt failed"
                );
            }
        }

        let delay = backoff.next_delay();
        tracing::info!(
            endpoint = %connection.endpoint(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting after delay"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break 'supervise,
        }
    }

    connection.disconnect().await;
    tracing::info!(endpoint = %connection.endpoint(), "reconnect supervisor stopped");
}
