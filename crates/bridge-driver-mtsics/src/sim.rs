//! Simulated MT-SICS balance.
//!
//! Speaks the same line protocol as a real balance over any async byte
//! stream. Used by the `simulate` CLI command (over TCP) and by tests (over
//! in-memory duplex pipes via [`SimConnector`]).
//!
//! Scriptable behaviour:
//! - gross weight, unit and stability flag
//! - fault injection (`+`, `-`, `I`, `ES`, ...)
//! - per-reply latency and a silent mode that never answers
//! - one-shot raw replies for malformed-response scenarios
//! - dropping every open client connection
//!
//! It also records what it saw: every command line, and the highest number
//! of commands that were outstanding at once. A correctly guarded client
//! never has more than one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::io::{Connector, DynStream, Endpoint};
use bridge_core::ConnectionError;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Serial number reported in the reset acknowledgement.
const SERIAL_NUMBER: &str = "SIM0000001";

#[derive(Debug)]
struct SimState {
    gross: f64,
    zero_offset: f64,
    tare: f64,
    unit: String,
    stable: bool,
    fault: Option<String>,
    response_delay: Duration,
    silent: bool,
    scripted: VecDeque<String>,
    commands: Vec<String>,
    outstanding: usize,
    max_outstanding: usize,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            gross: 0.0,
            zero_offset: 0.0,
            tare: 0.0,
            unit: "g".to_string(),
            stable: true,
            fault: None,
            response_delay: Duration::ZERO,
            silent: false,
            scripted: VecDeque::new(),
            commands: Vec::new(),
            outstanding: 0,
            max_outstanding: 0,
        }
    }
}

impl SimState {
    fn net(&self) -> f64 {
        self.gross - self.zero_offset - self.tare
    }

    fn weight_line(&self, echo: &str, value: f64) -> String {
        let flag = if self.stable { "S" } else { "D" };
        format!("{} {} {:>10.2} {}", echo, flag, value, self.unit)
    }

    fn fault_line(echo: &str, code: &str) -> String {
        if code.starts_with('E') && code.len() == 2 {
            code.to_string()
        } else {
            format!("{} {}", echo, code)
        }
    }

    /// Build the reply for one command line. `None` means stay silent.
    fn respond(&mut self, command: &str) -> Option<String> {
        if let Some(line) = self.scripted.pop_front() {
            return Some(line);
        }
        if self.silent {
            return None;
        }

        let reply = match command {
            "SI" | "S" => match &self.fault {
                Some(code) => Self::fault_line("S", code),
                None => self.weight_line("S", self.net()),
            },
            "Z" => match &self.fault {
                Some(code) => Self::fault_line("Z", code),
                None => {
                    self.zero_offset = self.gross;
                    self.tare = 0.0;
                    "Z A".to_string()
                }
            },
            "T" => match &self.fault {
                Some(code) => Self::fault_line("T", code),
                None => {
                    self.tare = self.gross - self.zero_offset;
                    self.weight_line("T", self.tare)
                }
            },
            "@" => {
                self.tare = 0.0;
                self.fault = None;
                format!("I4 A \"{}\"", SERIAL_NUMBER)
            }
            _ => "ES".to_string(),
        };
        Some(reply)
    }
}

/// Handle to a simulated balance. Clones share the same instrument.
#[derive(Debug, Clone)]
pub struct SimulatedBalance {
    state: Arc<Mutex<SimState>>,
    hangup: Arc<watch::Sender<u64>>,
}

impl Default for SimulatedBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBalance {
    /// New balance reading `0.00 g`, stable, no faults.
    pub fn new() -> Self {
        let (hangup, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            hangup: Arc::new(hangup),
        }
    }

    /// Set the gross load and the stability flag reported with it.
    pub fn set_weight(&self, gross: f64, stable: bool) {
        let mut state = self.state.lock();
        state.gross = gross;
        state.stable = stable;
    }

    /// Set the unit token.
    pub fn set_unit(&self, unit: impl Into<String>) {
        self.state.lock().unit = unit.into();
    }

    /// Answer every command with this status code until cleared.
    pub fn inject_fault(&self, code: Option<&str>) {
        self.state.lock().fault = code.map(str::to_string);
    }

    /// Latency added before each reply.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// When silent, commands are read but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Send `line` verbatim as the next reply, whatever the command.
    pub fn queue_reply(&self, line: impl Into<String>) {
        self.state.lock().scripted.push_back(line.into());
    }

    /// Close every open client connection.
    pub fn drop_clients(&self) {
        self.hangup.send_modify(|generation| *generation += 1);
    }

    /// Every command line received so far, in order.
    pub fn commands_received(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Highest number of commands ever awaiting a reply at the same time.
    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    /// Serve one client stream until it closes or [`drop_clients`](Self::drop_clients) is called.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut hangup = self.hangup.subscribe();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<String>();

        // Reader side: record arrivals so pipelined commands are visible
        let state = Arc::clone(&self.state);
        let reader = async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command = line.trim().to_string();
                if command.is_empty() {
                    continue;
                }
                {
                    let mut state = state.lock();
                    state.commands.push(command.clone());
                    state.outstanding += 1;
                    state.max_outstanding = state.max_outstanding.max(state.outstanding);
                }
                if queue_tx.send(command).is_err() {
                    break;
                }
            }
        };

        let state = Arc::clone(&self.state);
        let responder = async move {
            while let Some(command) = queue_rx.recv().await {
                let delay = state.lock().response_delay;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let reply = {
                    let mut state = state.lock();
                    state.outstanding = state.outstanding.saturating_sub(1);
                    state.respond(&command)
                };
                if let Some(reply) = reply {
                    let line = format!("{}\r\n", reply);
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = async { tokio::join!(reader, responder) } => {}
            _ = hangup.changed() => {
                tracing::debug!("simulated balance hanging up");
            }
        }
    }

    /// Accept TCP clients forever, serving each on its own task.
    pub async fn listen(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::info!(%peer, "simulator client connected");
            let balance = self.clone();
            tokio::spawn(async move {
                balance.serve(socket).await;
                tracing::info!(%peer, "simulator client disconnected");
            });
        }
    }
}

/// [`Connector`] that opens in-memory pipes to a [`SimulatedBalance`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    balance: SimulatedBalance,
    attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    refuse_remaining: Arc<AtomicUsize>,
    refuse_always: Arc<std::sync::atomic::AtomicBool>,
}

impl SimConnector {
    /// Connector for `balance`.
    pub fn new(balance: SimulatedBalance) -> Self {
        Self {
            balance,
            attempts: Arc::new(Mutex::new(Vec::new())),
            refuse_remaining: Arc::new(AtomicUsize::new(0)),
            refuse_always: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }

    /// Refuse every attempt while `refuse` is true.
    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_always.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts made.
    pub fn connect_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Time of every connect attempt, in order.
    pub fn attempt_times(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().clone()
    }

    fn should_refuse(&self) -> bool {
        if self.refuse_always.load(Ordering::SeqCst) {
            return true;
        }
        self.refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<DynStream, ConnectionError> {
        self.attempts.lock().push(tokio::time::Instant::now());
        if self.should_refuse() {
            return Err(ConnectionError::Io(format!("connection refused by {}", endpoint)));
        }

        let (client, server) = tokio::io::duplex(1024);
        let balance = self.balance.clone();
        tokio::spawn(async move { balance.serve(server).await });
        Ok(Box::new(client))
    }
}
