#![allow(unused_doc_comments)]
/**
 * This style of comments throws out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod common;
pub mod input;
pub mod peer_link;
pub mod stream;
pub mod stun;

pub use input::{InputEvent, InputSink, LoggingSink};
pub use peer_link::{LinkConfig, LinkEvent, LinkHandle, PeerLink, SignalCode};
pub use stream::{StreamReceiver, StreamSender};
pub use stun::{MappedEndpoint, StunClient};
