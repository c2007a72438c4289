//! Binary data encodings.
//!
//! - bincode: used for all datagram payloads on the network protocol.
pub mod bincode;
