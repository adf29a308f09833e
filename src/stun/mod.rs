/**
 * stun/mod.rs
 *
 * STUN client for NAT discovery (RFC 5389 subset, XOR-MAPPED-ADDRESS only)
 */

mod validator;

pub use validator::StunResponseValidator;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time;

/// STUN message types
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Reserved byte + IPv4 family as one 16-bit field
pub const FAMILY_IPV4: u16 = 0x0001;

pub const HEADER_LEN: usize = 20;
pub const TRANSACTION_ID_LEN: usize = 12;

/// Default STUN server provided by Google
pub const GOOGLE_STUN_SERVER: &str = "stun.l.google.com";
pub const GOOGLE_STUN_PORT: u16 = 19302;

/// Default interval between periodic queries
pub const QUERY_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded wait for one binding response, and how many requests to send
/// before giving up on an exchange
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_BUDGET: u32 = 3;

const RECV_BUF_LEN: usize = 1024;

/// Public address of the local UDP port as seen by the STUN server.
///
/// Only produced after the full structural validation and the post-decode
/// sanity checks have passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedEndpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for MappedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Interface to query a STUN server for the public IP and port of a local
/// UDP port.
pub struct StunClient {
    local_port: u16,
    public_endpoint: Option<MappedEndpoint>,
}

impl StunClient {
    /// Create a new STUN client for the given local port.
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            public_endpoint: None,
        }
    }

    /// Query a STUN server once.
    ///
    /// Resolution failure is fatal. A response that fails validation is
    /// dropped with a diagnostic and the previously known endpoint is kept.
    /// Exhausting the retry budget without a response returns `None`.
    pub async fn query(
        &mut self,
        server_name: &str,
        server_port: u16,
    ) -> Result<Option<&MappedEndpoint>> {
        let server_addr = resolve_endpoint(server_name, server_port).await?;
        let socket = self.bind_query_socket()?;

        let transaction_id: [u8; TRANSACTION_ID_LEN] = rand::random();
        let request = build_binding_request(&transaction_id);

        if let Some(endpoint) = self
            .exchange(&socket, server_addr, &request, &transaction_id)
            .await?
        {
            self.public_endpoint = Some(endpoint);
            return Ok(self.public_endpoint.as_ref());
        }

        Ok(None)
    }

    /// Repeat [`StunClient::query`] forever on a fixed interval, invoking
    /// `callback` after each attempt whether or not it produced an endpoint.
    ///
    /// Keeps the discovered endpoint fresh across NAT rebinding.
    pub async fn periodic_query<F>(
        &mut self,
        mut callback: F,
        interval: Duration,
        server_name: &str,
        server_port: u16,
    ) -> Result<()>
    where
        F: FnMut(Option<&MappedEndpoint>),
    {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            self.query(server_name, server_port).await?;
            callback(self.public_endpoint.as_ref());
        }
    }

    /// The most recently discovered public endpoint, if any.
    pub fn public_endpoint(&self) -> Option<&MappedEndpoint> {
        self.public_endpoint.as_ref()
    }

    /// One bounded request/response exchange with the server.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        server_addr: SocketAddr,
        request: &[u8],
        transaction_id: &[u8; TRANSACTION_ID_LEN],
    ) -> Result<Option<MappedEndpoint>> {
        let mut buf = [0u8; RECV_BUF_LEN];

        for attempt in 1..=RETRY_BUDGET {
            socket
                .send_to(request, server_addr)
                .await
                .context("Failed to send STUN request")?;

            let deadline = time::Instant::now() + RESPONSE_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(time::Instant::now());
                if remaining.is_zero() {
                    break;
                }

                match time::timeout(remaining, socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(received) => {
                        let (len, from) =
                            received.context("Failed to receive STUN response")?;
                        if from != server_addr {
                            // Does not consume the attempt
                            warn!("dropping STUN datagram from unexpected sender {}", from);
                            continue;
                        }
                        // First datagram from the server settles the exchange
                        return Ok(decode_response(&buf[..len], transaction_id));
                    }
                }
            }

            debug!("STUN attempt {}/{} timed out", attempt, RETRY_BUDGET);
        }

        warn!(
            "no response from STUN server {} after {} attempts",
            server_addr, RETRY_BUDGET
        );
        Ok(None)
    }

    /// Bind the query socket on the configured local port.
    ///
    /// SO_REUSEADDR lets repeated queries rebind the port promptly.
    fn bind_query_socket(&self) -> Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("Failed to create UDP socket")?;
        socket
            .set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;

        let addr: SocketAddr = ([0, 0, 0, 0], self.local_port).into();
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind UDP socket on port {}", self.local_port))?;

        UdpSocket::from_std(socket.into()).context("Failed to register socket with the runtime")
    }
}

/// Resolve the STUN server to its first IPv4 address.
async fn resolve_endpoint(server_name: &str, server_port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((server_name, server_port))
        .await
        .with_context(|| format!("Failed to resolve STUN server {}", server_name))?;

    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("No IPv4 address for STUN server {}", server_name))
}

/// Build a STUN binding request: fixed header, zero-length body, fresh
/// transaction id, no attributes.
fn build_binding_request(transaction_id: &[u8; TRANSACTION_ID_LEN]) -> Vec<u8> {
    let mut request = Vec::with_capacity(HEADER_LEN);

    // Message type (16 bits)
    request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits) - no attributes
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    request
}

/// Validate a binding response and decode its XOR-MAPPED-ADDRESS.
fn decode_response(
    data: &[u8],
    transaction_id: &[u8; TRANSACTION_ID_LEN],
) -> Option<MappedEndpoint> {
    let response_validator = StunResponseValidator::new(data, transaction_id);
    if !response_validator.validate_stun_response() {
        return None;
    }

    let xor_port = u16::from_be_bytes([data[26], data[27]]);
    let xor_ip = u32::from_be_bytes([data[28], data[29], data[30], data[31]]);

    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;
    let ip_bits = xor_ip ^ MAGIC_COOKIE;
    let octets = ip_bits.to_be_bytes();
    let ip = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);

    if !validator::validate_ip(&ip) || !validator::validate_port(port) {
        return None;
    }

    Some(MappedEndpoint { ip, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    /// Build a binding response carrying `ip:port` XOR'd with the cookie.
    fn encode_response(transaction_id: &[u8; 12], ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(transaction_id);
        buf.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&FAMILY_IPV4.to_be_bytes());
        buf.extend_from_slice(&(port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        buf.extend_from_slice(&(u32::from_be_bytes(ip) ^ MAGIC_COOKIE).to_be_bytes());
        buf
    }

    #[test]
    fn xor_mapped_address_round_trips() {
        let transaction_id = [3u8; 12];
        let buf = encode_response(&transaction_id, [203, 0, 113, 5], 54321);

        let endpoint = decode_response(&buf, &transaction_id).unwrap();
        assert_eq!(endpoint.ip, "203.0.113.5");
        assert_eq!(endpoint.port, 54321);
        assert_eq!(endpoint.to_string(), "203.0.113.5:54321");
    }

    #[test]
    fn rejects_tampered_response() {
        let transaction_id = [3u8; 12];
        let mut buf = encode_response(&transaction_id, [203, 0, 113, 5], 54321);
        buf[9] ^= 0x01; // transaction id no longer matches
        assert_eq!(decode_response(&buf, &transaction_id), None);
    }

    #[test]
    fn binding_request_layout() {
        let transaction_id = [9u8; 12];
        let request = build_binding_request(&transaction_id);

        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&request[2..4], &[0, 0]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &transaction_id);
    }

    #[tokio::test]
    async fn query_against_local_server() {
        // Minimal in-process STUN responder: echo the transaction id back
        // with a fixed mapped address.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_LEN);

            let mut transaction_id = [0u8; 12];
            transaction_id.copy_from_slice(&buf[8..20]);
            let response = encode_response(&transaction_id, [198, 51, 100, 7], 40000);
            server.send_to(&response, from).await.unwrap();
        });

        let mut client = StunClient::new(0);
        let endpoint = tokio_test::assert_ok!(client.query("127.0.0.1", server_port).await).cloned();
        assert_eq!(
            endpoint,
            Some(MappedEndpoint {
                ip: "198.51.100.7".to_string(),
                port: 40000,
            })
        );
        assert_eq!(client.public_endpoint(), endpoint.as_ref());
    }

    #[tokio::test]
    async fn malformed_response_keeps_previous_endpoint() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            // Garbage that fails the first structural check
            server.send_to(&[0u8; 4], from).await.unwrap();
        });

        let mut client = StunClient::new(0);
        client.public_endpoint = Some(MappedEndpoint {
            ip: "192.0.2.1".to_string(),
            port: 1234,
        });

        let result = client.query("127.0.0.1", server_port).await.unwrap();
        assert!(result.is_none());
        assert_eq!(
            client.public_endpoint().map(|e| e.to_string()),
            Some("192.0.2.1:1234".to_string())
        );
    }
}
