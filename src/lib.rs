//! wiremux: a single-stream RPC connection manager.
//!
//! This crate multiplexes a bidirectional RPC protocol over one
//! byte-oriented transport (a TCP or TLS connection, an in-memory duplex).
//! It defines:
//!
//! - The connection manager ([`Manager`]) and its shutdown protocol
//! - Set-once signals ([`Signal`])
//! - The packet data model ([`Packet`], [`PacketId`], [`Kind`])
//! - The wire codec ([`PacketReader`], [`PacketWriter`])
//! - The stream contract ([`Stream`]) and default stream ([`RpcStream`])
//! - Error types ([`ManagerError`], [`TransportError`], [`FrameError`],
//!   [`ProtocolError`])

#![forbid(unsafe_code)]

mod error;
mod manager;
mod packet;
mod rpc;
mod signal;
mod stream;
mod wire;

pub use error::*;
pub use manager::*;
pub use packet::*;
pub use rpc::*;
pub use signal::*;
pub use stream::*;
pub use wire::*;
