/**
 * peer_link/mod.rs
 *
 * UDP peer link: keep-alive heartbeat plus the retransmitting
 * signal-request/ACK handshake used to negotiate the input stream
 */

mod signal;

pub use signal::{SignalCode, SIGNAL_WIDTH};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;

use crate::common;

pub const PING_INTERVAL: Duration = Duration::from_millis(1000);
pub const TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Timing knobs of one link instance.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Interval between heartbeat sends; doubles as the signal
    /// retransmission interval.
    pub heartbeat_interval: Duration,
    /// Silence window after which the link is dead.
    pub timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: PING_INTERVAL,
            timeout: TIMEOUT,
        }
    }
}

/// Peer link errors
#[derive(Debug)]
pub enum LinkError {
    Timeout,
    InvalidRemote(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Timeout => write!(f, "Connection timed out"),
            LinkError::InvalidRemote(remote) => {
                write!(f, "Invalid remote endpoint: {}", remote)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Observer notifications emitted by a running link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A keep-alive round trip completed.
    Pong { latency: Duration },
    /// The remote initiated a negotiation; the mapped ACK was sent back.
    Signal {
        received: SignalCode,
        acked_with: SignalCode,
    },
    /// The remote acknowledged our pending signal; back to steady state.
    Acked(SignalCode),
    /// Nothing received within the timeout window; the link is dead.
    TimedOut,
}

/// Command/event surface handed to the embedder of a link.
pub struct LinkHandle {
    commands: mpsc::Sender<SignalCode>,
    events: mpsc::Receiver<LinkEvent>,
}

impl LinkHandle {
    /// Queue a signal command for the link task.
    pub async fn command(&self, code: SignalCode) -> Result<()> {
        self.commands
            .send(code)
            .await
            .context("Link task is gone")
    }

    /// A clonable command sender for a separate intake task.
    pub fn commander(&self) -> LinkCommander {
        LinkCommander {
            commands: self.commands.clone(),
        }
    }

    /// Next observer event; `None` once the link task has ended.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

/// Standalone command intake into a running link.
#[derive(Clone)]
pub struct LinkCommander {
    commands: mpsc::Sender<SignalCode>,
}

impl LinkCommander {
    pub async fn command(&self, code: SignalCode) -> Result<()> {
        self.commands
            .send(code)
            .await
            .context("Link task is gone")
    }
}

/// UDP link to one fixed peer endpoint.
///
/// Runs as a single task multiplexing the heartbeat timer, the socket
/// receive, and the command channel, so the handlers never run
/// concurrently. Retransmission of the pending signal on every heartbeat
/// tick is the sole reliability mechanism.
pub struct PeerLink {
    socket: UdpSocket,
    remote: SocketAddr,
    pending: SignalCode,
    send_time: Instant,
    last_receive: Instant,
    config: LinkConfig,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<SignalCode>,
    commands_open: bool,
}

impl PeerLink {
    /// Validate the remote "IP:port" string, bind the local port, and
    /// create the link in steady state.
    pub async fn bind(
        local_port: u16,
        remote: &str,
        config: LinkConfig,
    ) -> Result<(PeerLink, LinkHandle)> {
        if !common::validate_socket_string(remote) {
            return Err(LinkError::InvalidRemote(remote.to_string()).into());
        }
        let remote_addr: SocketAddr = remote
            .parse()
            .context("Failed to parse remote endpoint")?;

        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("Failed to bind UDP socket on port {}", local_port))?;

        Ok(Self::from_socket(socket, remote_addr, config))
    }

    /// Build a link over an already-bound socket.
    pub fn from_socket(
        socket: UdpSocket,
        remote: SocketAddr,
        config: LinkConfig,
    ) -> (PeerLink, LinkHandle) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let now = Instant::now();
        let link = PeerLink {
            socket,
            remote,
            pending: SignalCode::Ping,
            send_time: now,
            last_receive: now,
            config,
            events: event_tx,
            commands: command_rx,
            commands_open: true,
        };
        let handle = LinkHandle {
            commands: command_tx,
            events: event_rx,
        };
        (link, handle)
    }

    /// The configured remote endpoint.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The signal that the next heartbeat tick will (re)transmit.
    pub fn pending_signal(&self) -> SignalCode {
        self.pending
    }

    /// Drive the link until it dies.
    ///
    /// Returns [`LinkError::Timeout`] once nothing has been received from
    /// the remote within the timeout window; no further sends are
    /// scheduled after that.
    pub async fn run(mut self) -> Result<()> {
        info!("peer link up, remote {}", self.remote);
        let mut ticker = time::interval(self.config.heartbeat_interval);
        let mut buf = [0u8; 64];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.last_receive.elapsed() > self.config.timeout {
                        warn!("connection timed out");
                        self.emit(LinkEvent::TimedOut);
                        return Err(LinkError::Timeout.into());
                    }
                    self.send_time = Instant::now();
                    self.send_signal(self.pending).await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => warn!("receive error: {}", e),
                    }
                }
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(code) => self.handle_command(code),
                        None => self.commands_open = false,
                    }
                }
            }
        }
    }

    /// Validate and dispatch one received datagram.
    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if from != self.remote {
            warn!("received message from unknown endpoint: {}", from);
            return;
        }
        if data.len() != SIGNAL_WIDTH {
            warn!("received invalid message size: {}", data.len());
            return;
        }

        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let code = match SignalCode::from_wire(raw) {
            Some(code) => code,
            None => {
                warn!("unknown message: {}", raw);
                return;
            }
        };

        self.last_receive = Instant::now();

        match code {
            SignalCode::Ping => self.send_signal(SignalCode::Pong).await,
            SignalCode::Pong => self.handle_pong(),
            SignalCode::StreamRequest | SignalCode::StreamAccept | SignalCode::StreamReject => {
                self.handle_stream_signal(code).await;
            }
            SignalCode::AckStreamRequest
            | SignalCode::AckStreamAccept
            | SignalCode::AckStreamReject => {
                self.reset_ping(code);
            }
            SignalCode::Ack | SignalCode::Nack => {
                debug!("ignoring unhandled signal: {:?}", code);
            }
        }
    }

    fn handle_pong(&mut self) {
        let latency = self.last_receive.duration_since(self.send_time);
        self.emit(LinkEvent::Pong { latency });
    }

    /// The remote wants to change the stream state: acknowledge and tell
    /// the observer.
    async fn handle_stream_signal(&mut self, code: SignalCode) {
        let acked_with = match code.ack() {
            Some(ack) => ack,
            None => return,
        };
        self.send_signal(acked_with).await;
        self.emit(LinkEvent::Signal {
            received: code,
            acked_with,
        });
    }

    /// Our own signal was seen; return to steady-state keep-alive.
    fn reset_ping(&mut self, ack: SignalCode) {
        self.pending = SignalCode::Ping;
        self.emit(LinkEvent::Acked(ack));
    }

    /// External command intake. The pending slot only ever holds an
    /// initiating code.
    fn handle_command(&mut self, code: SignalCode) {
        if !matches!(
            code,
            SignalCode::StreamRequest | SignalCode::StreamAccept | SignalCode::StreamReject
        ) {
            warn!("rejecting command outside the initiating subset: {:?}", code);
            return;
        }
        self.pending = code;
    }

    async fn send_signal(&self, code: SignalCode) {
        if let Err(e) = self.socket.send_to(&code.to_wire(), self.remote).await {
            warn!("send error: {}", e);
        }
    }

    fn emit(&self, event: LinkEvent) {
        // A lagging observer loses events instead of stalling the loop
        if let Err(e) = self.events.try_send(event) {
            debug!("dropping link event: {}", e);
        }
    }
}
