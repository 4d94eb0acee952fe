//! Wire layer between connections and the hub.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (PortFrame, HubFrame, Envelope)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **port**: Host channel boundary and the relay-port marker
//! - **transport**: Unix socket host transport

pub mod codec;
pub mod port;
pub mod protocol;
pub mod transport;
