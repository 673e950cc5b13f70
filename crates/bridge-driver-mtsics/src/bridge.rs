//! Bridge facade: the call contract the rest of the system uses.
//!
//! One `Bridge` is constructed explicitly at daemon startup and shared by
//! `Arc`. It decides once, from configuration, whether the bridge is
//! `Disabled` (no host: no socket, no supervisor, every operation answers
//! `NotConfigured`) or active (connection plus reconnect supervisor).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::io::{Connector, TcpConnector};
use bridge_core::{
    BalanceControl, BridgeConfig, BridgeError, BridgeResult, ConnectivityCell, ConnectivityState,
    Reading, WeightSource,
};
use parking_lot::Mutex;
use tracing::instrument;

use crate::connection::InstrumentConnection;
use crate::supervisor::{self, ReconnectPolicy, SupervisorHandle};

struct Active {
    connection: Arc<InstrumentConnection>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

/// Process-wide handle to the instrument.
pub struct Bridge {
    active: Option<Active>,
    state: Arc<ConnectivityCell>,
    command_timeout: Duration,
    shut_down: AtomicBool,
}

impl Bridge {
    /// Start a bridge over TCP.
    ///
    /// Must be called from within a Tokio runtime when a host is configured,
    /// since the reconnect supervisor is spawned immediately.
    pub fn start(config: &BridgeConfig) -> Self {
        Self::start_with_connector(config, Arc::new(TcpConnector))
    }

    /// Start a bridge using a custom transport.
    pub fn start_with_connector(config: &BridgeConfig, connector: Arc<dyn Connector>) -> Self {
        let Some(endpoint) = config.instrument.endpoint() else {
            tracing::warn!("no balance host configured, bridge running in disabled mode");
            return Self::disabled();
        };

        let connection = Arc::new(InstrumentConnection::new(
            endpoint,
            connector,
            config.instrument.connect_timeout,
        ));
        let state = connection.state_handle();
        let handle = supervisor::spawn(
            Arc::clone(&connection),
            ReconnectPolicy::from(&config.reconnect),
        );

        Self {
            active: Some(Active {
                connection,
                supervisor: Mutex::new(Some(handle)),
            }),
            state,
            command_timeout: config.instrument.command_timeout,
            shut_down: AtomicBool::new(false),
        }
    }

    /// A bridge with no instrument.
    pub fn disabled() -> Self {
        Self {
            active: None,
            state: Arc::new(ConnectivityCell::new(ConnectivityState::Disabled)),
            command_timeout: Duration::ZERO,
            shut_down: AtomicBool::new(false),
        }
    }

    /// True when no instrument is configured.
    pub fn is_disabled(&self) -> bool {
        self.active.is_none()
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectivityState {
        self.state.get()
    }

    /// Externally reported status: `disabled`, `connected` or `disconnected`.
    pub fn status(&self) -> &'static str {
        self.state().as_status_str()
    }

    fn connection(&self) -> BridgeResult<&InstrumentConnection> {
        let active = self.active.as_ref().ok_or(BridgeError::NotConfigured)?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }
        Ok(&active.connection)
    }

    /// Read one weight from the instrument.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_weight(&self) -> BridgeResult<Reading> {
        self.connection()?.read_weight(self.command_timeout).await
    }

    /// Zero the balance.
    pub async fn zero(&self) -> BridgeResult<()> {
        self.connection()?.zero(self.command_timeout).await
    }

    /// Tare the balance.
    pub async fn tare(&self) -> BridgeResult<Reading> {
        self.connection()?.tare(self.command_timeout).await
    }

    /// Wait until the instrument is connected, up to `timeout`.
    ///
    /// Returns the state observed last.
    pub async fn wait_for_connection(&self, timeout: Duration) -> ConnectivityState {
        if self.is_disabled() {
            return ConnectivityState::Disabled;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        // Subscribe before the first read so no transition slips between them
        let mut changes = self.state.subscribe();
        loop {
            let state = self.state();
            if state == ConnectivityState::Connected {
                return state;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return self.state(),
            }
        }
    }

    /// Stop the supervisor and close the socket. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        let handle = active.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        active.connection.disconnect().await;
        tracing::info!("bridge shut down");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state())
            .field(
                "endpoint",
                &self.active.as_ref().map(|a| a.connection.endpoint().to_string()),
            )
            .finish()
    }
}

#[async_trait]
impl WeightSource for Bridge {
    async fn read_weight(&self) -> BridgeResult<Reading> {
        Bridge::read_weight(self).await
    }

    fn connectivity(&self) -> ConnectivityState {
        self.state()
    }
}

#[async_trait]
impl BalanceControl for Bridge {
    async fn zero(&self) -> BridgeResult<()> {
        Bridge::zero(self).await
    }

    async fn tare(&self) -> BridgeResult<Reading> {
        Bridge::tare(self).await
    }
}
