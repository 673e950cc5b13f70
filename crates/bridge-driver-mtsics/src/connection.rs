//! Guarded half-duplex connection to one MT-SICS balance.
//!
//! The balance answers exactly one line per command and cannot tell two
//! interleaved commands apart, so every exchange (write command, read reply)
//! runs under a single async mutex. The mutex is held only for the
//! write+read; decoding happens after release.
//!
//! Connection-level failures (read deadline, peer close, I/O error) drop the
//! socket while the guard is still held, mark the link `Disconnected` and
//! wake the reconnect supervisor. Protocol errors leave the socket alone.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::io::{Connector, DynStream, Endpoint};
use bridge_core::{
    BridgeError, BridgeResult, ConnectionError, ConnectivityCell, ConnectivityState, Reading,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::instrument;

use crate::codec::{self, Command};

type SharedStream = Mutex<Option<BufReader<DynStream>>>;

/// One persistent connection to a balance.
pub struct InstrumentConnection {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    stream: SharedStream,
    state: Arc<ConnectivityCell>,
    link_lost: Arc<Notify>,
}

impl InstrumentConnection {
    /// Create an unconnected instance. No I/O happens until [`connect`](Self::connect).
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            connector,
            connect_timeout,
            stream: Mutex::new(None),
            state: Arc::new(ConnectivityCell::new(ConnectivityState::Disconnected)),
            link_lost: Arc::new(Notify::new()),
        }
    }

    /// Instrument address.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shared connectivity cell, readable without touching the exchange guard.
    pub fn state_handle(&self) -> Arc<ConnectivityCell> {
        Arc::clone(&self.state)
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectivityState {
        self.state.get()
    }

    /// True while a socket is believed usable.
    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectivityState::Connected
    }

    /// Signalled whenever the socket is dropped, by a failed exchange or by
    /// [`disconnect`](Self::disconnect).
    pub fn link_lost(&self) -> Arc<Notify> {
        Arc::clone(&self.link_lost)
    }

    /// Open a fresh socket, replacing any existing one.
    ///
    /// Single attempt bounded by the connect timeout; retrying is the
    /// supervisor's job.
    #[instrument(skip(self), fields(endpoint = %self.endpoint), err)]
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let opened = self
            .connector
            .connect(&self.endpoint, self.connect_timeout)
            .await;

        match opened {
            Ok(stream) => {
                let mut guard = self.stream.lock().await;
                *guard = Some(BufReader::new(stream));
                self.state.set(ConnectivityState::Connected);
                tracing::info!(endpoint = %self.endpoint, "connected to balance");
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectivityState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the socket. Safe to call repeatedly.
    ///
    /// A running supervisor is woken and schedules a reconnect, the same as
    /// after a failed exchange.
    pub async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut reader) = guard.take() {
            if let Err(e) = reader.get_mut().shutdown().await {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "error while closing socket"
                );
            }
            self.state.set(ConnectivityState::Disconnected);
            drop(guard);
            tracing::info!(endpoint = %self.endpoint, "disconnected from balance");
            self.link_lost.notify_one();
        }
    }

    /// Send `SI` and decode the reply.
    ///
    /// Waits behind any in-flight exchange. The timeout bounds the
    /// write+read, not the wait for the guard.
    pub async fn read_weight(&self, timeout: Duration) -> BridgeResult<Reading> {
        let line = self.execute(Command::WeightImmediate, timeout).await?;
        let reading = codec::decode_response(&line)?;
        tracing::trace!(
            value = reading.value,
            unit = %reading.unit,
            stable = reading.stable,
            "weight"
        );
        Ok(reading)
    }

    /// Send `Z` and check the acknowledgement.
    pub async fn zero(&self, timeout: Duration) -> BridgeResult<()> {
        let line = self.execute(Command::Zero, timeout).await?;
        codec::decode_acknowledgement(Command::Zero, &line)?;
        tracing::info!(endpoint = %self.endpoint, "balance zeroed");
        Ok(())
    }

    /// Send `T` and return the stored tare weight.
    pub async fn tare(&self, timeout: Duration) -> BridgeResult<Reading> {
        let line = self.execute(Command::Tare, timeout).await?;
        let tare = codec::decode_response(&line)?;
        tracing::info!(
            endpoint = %self.endpoint,
            value = tare.value,
            unit = %tare.unit,
            "balance tared"
        );
        Ok(tare)
    }

    /// Run one guarded exchange and return the raw reply line.
    #[instrument(skip(self), fields(endpoint = %self.endpoint), level = "debug")]
    pub async fn execute(&self, command: Command, timeout: Duration) -> BridgeResult<String> {
        let mut guard = self.stream.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };

        let outcome = match tokio::time::timeout(timeout, exchange(reader, command)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };

        match outcome {
            Ok(line) => Ok(line),
            Err(e) => {
                // A desynchronized half-duplex stream is unusable
                *guard = None;
                drop(guard);
                self.mark_lost(&e);
                Err(BridgeError::Connection(e))
            }
        }
    }

    fn mark_lost(&self, cause: &ConnectionError) {
        let previous = self.state.set(ConnectivityState::Disconnected);
        tracing::warn!(
            endpoint = %self.endpoint,
            error = %cause,
            previous = %previous,
            "lost connection to balance"
        );
        self.link_lost.notify_one();
    }
}

/// Write one command and read its non-empty reply line.
async fn exchange(
    reader: &mut BufReader<DynStream>,
    command: Command,
) -> Result<String, ConnectionError> {
    let bytes = codec::encode_command(command);
    tracing::debug!(command = %command, "sending command");
    reader.get_mut().write_all(&bytes).await?;
    reader.get_mut().flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ConnectionError::Closed);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            tracing::debug!("skipping empty line");
            continue;
        }
        tracing::debug!(response = %trimmed, "raw response");
        return Ok(trimmed.to_string());
    }
}

impl std::fmt::Debug for InstrumentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConnector, SimulatedBalance};
    use bridge_core::ProtocolError;

    fn connection_to(balance: &SimulatedBalance) -> (Arc<InstrumentConnection>, SimConnector) {
        let connector = SimConnector::new(balance.clone());
        let connection = InstrumentConnection::new(
            Endpoint::new("sim", 8001),
            Arc::new(connector.clone()),
            Duration::from_secs(1),
        );
        (Arc::new(connection), connector)
    }

    #[tokio::test]
    async fn reads_weight_after_connect() {
        let balance = SimulatedBalance::new();
        balance.set_weight(123.45, true);
        let (connection, _) = connection_to(&balance);

        connection.connect().await.unwrap();
        assert!(connection.is_connected());

        let reading = connection.read_weight(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reading, Reading::new(123.45, "g", true));
        assert_eq!(balance.commands_received(), vec!["SI".to_string()]);
    }

    #[tokio::test]
    async fn read_without_socket_is_not_connected() {
        let balance = SimulatedBalance::new();
        let (connection, _) = connection_to(&balance);

        let err = connection.read_weight(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BridgeError::Connection(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn concurrent_reads_never_overlap_on_the_wire() {
        let balance = SimulatedBalance::new();
        balance.set_weight(5.0, true);
        balance.set_response_delay(Duration::from_millis(20));
        let (connection, _) = connection_to(&balance);
        connection.connect().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let connection = Arc::clone(&connection);
            tasks.push(tokio::spawn(async move {
                connection.read_weight(Duration::from_secs(2)).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(balance.commands_received().len(), 6);
        assert_eq!(balance.max_outstanding(), 1);
    }

    #[tokio::test]
    async fn read_timeout_drops_socket_and_signals_supervisor() {
        let balance = SimulatedBalance::new();
        balance.set_silent(true);
        let (connection, _) = connection_to(&balance);
        connection.connect().await.unwrap();
        let link_lost = connection.link_lost();

        let err = connection
            .read_weight(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Connection(ConnectionError::Timeout));
        assert_eq!(connection.state(), ConnectivityState::Disconnected);

        tokio::time::timeout(Duration::from_secs(1), link_lost.notified())
            .await
            .expect("supervisor should be woken");

        let err = connection.read_weight(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, BridgeError::Connection(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn protocol_errors_keep_the_socket() {
        let balance = SimulatedBalance::new();
        balance.set_weight(1.0, false);
        let (connection, connector) = connection_to(&balance);
        connection.connect().await.unwrap();

        balance.queue_reply("garbage");
        let err = connection.read_weight(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::MalformedResponse { .. })
        ));

        balance.inject_fault(Some("+"));
        let err = connection.read_weight(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BridgeError::Protocol(ProtocolError::fault("+")));
        balance.inject_fault(None);

        let reading = connection.read_weight(Duration::from_secs(1)).await.unwrap();
        assert!(!reading.stable);
        assert!(connection.is_connected());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn peer_close_is_connection_level() {
        let balance = SimulatedBalance::new();
        let (connection, _) = connection_to(&balance);
        connection.connect().await.unwrap();

        balance.drop_clients();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = connection.read_weight(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BridgeError::Connection(ConnectionError::Closed));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn zero_and_tare_round_trip() {
        let balance = SimulatedBalance::new();
        balance.set_weight(50.0, true);
        let (connection, _) = connection_to(&balance);
        connection.connect().await.unwrap();

        let tare = connection.tare(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tare.value, 50.0);
        let net = connection.read_weight(Duration::from_secs(1)).await.unwrap();
        assert_eq!(net.value, 0.0);

        connection.zero(Duration::from_secs(1)).await.unwrap();
        balance.inject_fault(Some("I"));
        let err = connection.zero(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BridgeError::Protocol(ProtocolError::fault("I")));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let balance = SimulatedBalance::new();
        let (connection, _) = connection_to(&balance);
        connection.connect().await.unwrap();

        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn failed_connect_reports_error() {
        let balance = SimulatedBalance::new();
        let (connection, connector) = connection_to(&balance);
        connector.refuse_next(1);

        assert!(connection.connect().await.is_err());
        assert_eq!(connection.state(), ConnectivityState::Disconnected);
        assert!(connection.connect().await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }
}
