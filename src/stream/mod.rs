/**
 * stream/mod.rs
 *
 * Input-forwarding stream transport: text ping/pong keep-alive plus
 * encoded input events, one datagram each
 */

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;

use crate::common;
use crate::input::{InputEvent, InputSink};
use crate::peer_link::{LinkConfig, LinkError};

const KEEPALIVE: &str = "ping";
const KEEPALIVE_REPLY: &str = "pong";

const MAX_DATAGRAM: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observer notifications from a running sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A keep-alive round trip completed.
    Pong { latency: Duration },
    /// Nothing received within the timeout window; the stream is dead.
    TimedOut,
}

/// Intake/event surface of a [`StreamSender`].
pub struct StreamSenderHandle {
    inputs: mpsc::Sender<InputEvent>,
    events: mpsc::Receiver<StreamEvent>,
}

impl StreamSenderHandle {
    /// Queue one captured event for forwarding.
    pub async fn forward(&self, event: InputEvent) -> Result<()> {
        self.inputs
            .send(event)
            .await
            .context("Stream sender task is gone")
    }

    /// A clonable event intake for a separate capture task.
    pub fn forwarder(&self) -> StreamForwarder {
        StreamForwarder {
            inputs: self.inputs.clone(),
        }
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

/// Standalone event intake into a running sender.
#[derive(Clone)]
pub struct StreamForwarder {
    inputs: mpsc::Sender<InputEvent>,
}

impl StreamForwarder {
    pub async fn forward(&self, event: InputEvent) -> Result<()> {
        self.inputs
            .send(event)
            .await
            .context("Stream sender task is gone")
    }
}

/// Forwards captured input events to the remote peer and keeps the NAT
/// mapping alive with a ping/pong heartbeat.
pub struct StreamSender {
    socket: UdpSocket,
    remote: SocketAddr,
    ping_time: Instant,
    last_pong: Instant,
    config: LinkConfig,
    events: mpsc::Sender<StreamEvent>,
    inputs: mpsc::Receiver<InputEvent>,
    inputs_open: bool,
}

impl StreamSender {
    pub async fn bind(
        local_port: u16,
        remote: &str,
        config: LinkConfig,
    ) -> Result<(StreamSender, StreamSenderHandle)> {
        let remote_addr = parse_remote(remote)?;
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("Failed to bind UDP socket on port {}", local_port))?;
        Ok(Self::from_socket(socket, remote_addr, config))
    }

    pub fn from_socket(
        socket: UdpSocket,
        remote: SocketAddr,
        config: LinkConfig,
    ) -> (StreamSender, StreamSenderHandle) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let now = Instant::now();
        let sender = StreamSender {
            socket,
            remote,
            ping_time: now,
            last_pong: now,
            config,
            events: event_tx,
            inputs: input_rx,
            inputs_open: true,
        };
        let handle = StreamSenderHandle {
            inputs: input_tx,
            events: event_rx,
        };
        (sender, handle)
    }

    /// Drive the stream until it dies.
    pub async fn run(mut self) -> Result<()> {
        info!("input stream up, remote {}", self.remote);
        let mut ticker = time::interval(self.config.heartbeat_interval);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.last_pong.elapsed() > self.config.timeout {
                        warn!("connection timed out");
                        let _ = self.events.try_send(StreamEvent::TimedOut);
                        return Err(LinkError::Timeout.into());
                    }
                    self.ping_time = Instant::now();
                    self.send_text(KEEPALIVE).await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                        Err(e) => warn!("receive error: {}", e),
                    }
                }
                event = self.inputs.recv(), if self.inputs_open => {
                    match event {
                        Some(event) => self.send_text(&event.encode()).await,
                        None => self.inputs_open = false,
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if !validate_datagram(data, from, self.remote) {
            return;
        }

        match std::str::from_utf8(data) {
            Ok(KEEPALIVE_REPLY) => {
                self.last_pong = Instant::now();
                let latency = self.last_pong.duration_since(self.ping_time);
                if let Err(e) = self.events.try_send(StreamEvent::Pong { latency }) {
                    debug!("dropping stream event: {}", e);
                }
            }
            Ok(other) => debug!("unexpected stream reply: {}", other),
            Err(_) => warn!("received non-text datagram"),
        }
    }

    async fn send_text(&self, text: &str) {
        if let Err(e) = self.socket.send_to(text.as_bytes(), self.remote).await {
            warn!("send error: {}", e);
        }
    }
}

/// Receives the input stream: answers keep-alives and hands decoded events
/// to the configured injection sink.
pub struct StreamReceiver {
    socket: UdpSocket,
    remote: SocketAddr,
    sink: Box<dyn InputSink>,
}

impl StreamReceiver {
    pub async fn bind(
        local_port: u16,
        remote: &str,
        sink: Box<dyn InputSink>,
    ) -> Result<StreamReceiver> {
        let remote_addr = parse_remote(remote)?;
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("Failed to bind UDP socket on port {}", local_port))?;
        Ok(Self::from_socket(socket, remote_addr, sink))
    }

    pub fn from_socket(
        socket: UdpSocket,
        remote: SocketAddr,
        sink: Box<dyn InputSink>,
    ) -> StreamReceiver {
        StreamReceiver {
            socket,
            remote,
            sink,
        }
    }

    /// Receive loop; passive, so it never times out on its own.
    pub async fn run(mut self) -> Result<()> {
        info!("input stream receiver up, remote {}", self.remote);
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("Failed to receive stream datagram")?;
            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if !validate_datagram(data, from, self.remote) {
            return;
        }

        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                warn!("received non-text datagram");
                return;
            }
        };

        if text == KEEPALIVE {
            if let Err(e) = self.socket.send_to(KEEPALIVE_REPLY.as_bytes(), from).await {
                warn!("send error: {}", e);
            }
            return;
        }

        match InputEvent::parse(text) {
            Ok(event) => self.sink.apply(&event),
            Err(e) => warn!("dropping malformed input event: {}", e),
        }
    }
}

fn parse_remote(remote: &str) -> Result<SocketAddr> {
    if !common::validate_socket_string(remote) {
        return Err(LinkError::InvalidRemote(remote.to_string()).into());
    }
    remote.parse().context("Failed to parse remote endpoint")
}

fn validate_datagram(data: &[u8], from: SocketAddr, remote: SocketAddr) -> bool {
    if from != remote {
        warn!("received message from unknown endpoint: {}", from);
        return false;
    }
    if data.is_empty() {
        warn!("received empty message");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::EventKind;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<InputEvent>>>);

    impl InputSink for RecordingSink {
        fn apply(&mut self, event: &InputEvent) {
            self.0.lock().unwrap().push(*event);
        }
    }

    #[tokio::test]
    async fn receiver_answers_ping_and_dispatches_events() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = socket.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let receiver = StreamReceiver::from_socket(
            socket,
            peer_addr,
            Box::new(RecordingSink(recorded.clone())),
        );
        tokio::spawn(receiver.run());

        peer.send_to(KEEPALIVE.as_bytes(), receiver_addr)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], KEEPALIVE_REPLY.as_bytes());

        let event = InputEvent::new(EventKind::KeyPressed, 42);
        peer.send_to(event.encode().as_bytes(), receiver_addr)
            .await
            .unwrap();

        // Foreign senders and garbage must both be dropped
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to("1:1:0:0".as_bytes(), receiver_addr)
            .await
            .unwrap();
        peer.send_to("not-an-event".as_bytes(), receiver_addr)
            .await
            .unwrap();

        time::sleep(Duration::from_millis(200)).await;
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.as_slice(), &[event]);
    }

    #[tokio::test]
    async fn sender_forwards_events_and_reports_latency() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = LinkConfig {
            heartbeat_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
        };
        let (sender, mut handle) = StreamSender::from_socket(socket, peer_addr, config);
        tokio::spawn(sender.run());

        // First heartbeat arrives immediately
        let mut buf = [0u8; 64];
        let (len, sender_addr) = time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], KEEPALIVE.as_bytes());

        peer.send_to(KEEPALIVE_REPLY.as_bytes(), sender_addr)
            .await
            .unwrap();
        let event = time::timeout(Duration::from_secs(2), handle.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StreamEvent::Pong { .. }));

        let input = InputEvent::new(EventKind::KeyReleased, 7);
        handle.forward(input).await.unwrap();
        loop {
            let (len, _) = time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let text = std::str::from_utf8(&buf[..len]).unwrap();
            if text == KEEPALIVE {
                continue;
            }
            assert_eq!(text, input.encode());
            break;
        }
    }
}
