/**
 * peer_link/signal.rs
 *
 * Signal codes exchanged between peers and their ACK / string-token tables
 */

use std::fmt;

/// Width of one signal datagram on the wire.
pub const SIGNAL_WIDTH: usize = 4;

/// Messages that can be sent between peers.
///
/// Wire values 1-10, transmitted as one big-endian 32-bit integer per
/// datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalCode {
    Ping = 1,
    Pong = 2,
    Ack = 3,
    Nack = 4,
    StreamRequest = 5,
    AckStreamRequest = 6,
    StreamAccept = 7,
    AckStreamAccept = 8,
    StreamReject = 9,
    AckStreamReject = 10,
}

impl SignalCode {
    /// Decode a wire value. Out-of-range values are rejected.
    pub const fn from_wire(value: u32) -> Option<SignalCode> {
        match value {
            1 => Some(SignalCode::Ping),
            2 => Some(SignalCode::Pong),
            3 => Some(SignalCode::Ack),
            4 => Some(SignalCode::Nack),
            5 => Some(SignalCode::StreamRequest),
            6 => Some(SignalCode::AckStreamRequest),
            7 => Some(SignalCode::StreamAccept),
            8 => Some(SignalCode::AckStreamAccept),
            9 => Some(SignalCode::StreamReject),
            10 => Some(SignalCode::AckStreamReject),
            _ => None,
        }
    }

    /// Encode for the wire.
    pub fn to_wire(self) -> [u8; SIGNAL_WIDTH] {
        (self as u32).to_be_bytes()
    }

    /// The code acknowledging this one.
    ///
    /// Defined exactly for the four initiating codes; `None` for the rest.
    pub const fn ack(self) -> Option<SignalCode> {
        match self {
            SignalCode::Ping => Some(SignalCode::Pong),
            SignalCode::StreamRequest => Some(SignalCode::AckStreamRequest),
            SignalCode::StreamAccept => Some(SignalCode::AckStreamAccept),
            SignalCode::StreamReject => Some(SignalCode::AckStreamReject),
            _ => None,
        }
    }

    /// Whether this code may sit in the pending-signal slot.
    pub const fn is_initiating(self) -> bool {
        matches!(
            self,
            SignalCode::Ping
                | SignalCode::StreamRequest
                | SignalCode::StreamAccept
                | SignalCode::StreamReject
        )
    }

    /// Control-channel token for the six stream signals; `None` for
    /// PING/PONG/ACK/NACK, which never cross the control channel.
    pub const fn token(self) -> Option<&'static str> {
        match self {
            SignalCode::StreamRequest => Some("stream_request"),
            SignalCode::AckStreamRequest => Some("ack_stream_request"),
            SignalCode::StreamAccept => Some("stream_accept"),
            SignalCode::AckStreamAccept => Some("ack_stream_accept"),
            SignalCode::StreamReject => Some("stream_reject"),
            SignalCode::AckStreamReject => Some("ack_stream_reject"),
            _ => None,
        }
    }

    /// Reverse of [`SignalCode::token`].
    pub fn from_token(token: &str) -> Option<SignalCode> {
        match token {
            "stream_request" => Some(SignalCode::StreamRequest),
            "ack_stream_request" => Some(SignalCode::AckStreamRequest),
            "stream_accept" => Some(SignalCode::StreamAccept),
            "ack_stream_accept" => Some(SignalCode::AckStreamAccept),
            "stream_reject" => Some(SignalCode::StreamReject),
            "ack_stream_reject" => Some(SignalCode::AckStreamReject),
            _ => None,
        }
    }
}

impl fmt::Display for SignalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.token() {
            Some(token) => write!(f, "{}", token),
            None => write!(f, "{:?}", self),
        }
    }
}
