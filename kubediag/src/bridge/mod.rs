//! Bridge protocol adapter
//!
//! Presents tools hosted by remote servers exactly like local ones.
//! Remote servers speak newline-delimited JSON-RPC 2.0 over a pipe to a
//! spawned process or over a TCP stream.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{BridgeClient, Liveness};
pub use protocol::RemoteToolInfo;
pub use server::BridgeServer;
pub use transport::{connector_for, Connector, RawLink, TransportError};
