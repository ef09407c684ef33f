//! The stream contract consumed by the connection manager.

use std::future::Future;

use crate::{ManagerError, Packet, PacketWriter, Signal};

/// A logical RPC hosted on a connection.
///
/// The manager supervises exactly one live stream at a time: it forwards
/// incoming packets into the stream via [`handle_packet`](Stream::handle_packet)
/// and propagates cancellation via [`cancel`](Stream::cancel). Everything else
/// about the stream — its caller-facing API, its use of the shared
/// [`PacketWriter`] — is the stream's own business.
///
/// # Key invariant
///
/// Only the manager's forwarder calls `handle_packet`, and only while the
/// stream holds the connection's single stream slot. Implementations never
/// see concurrent `handle_packet` calls.
pub trait Stream: Send + Sync + 'static {
    /// Construct a stream bound to the shared packet writer.
    ///
    /// `id` is assigned by the manager for client streams and carried over
    /// verbatim from the remote's invoke for server streams.
    fn open(id: u64, writer: PacketWriter) -> Self;

    /// Route one incoming packet into the stream.
    ///
    /// Returns `Ok(true)` to keep receiving, `Ok(false)` once the stream
    /// needs no more packets. An `Err` is fatal to the whole connection.
    /// The returned future may be dropped without completing if the
    /// connection terminates while handling is pending.
    fn handle_packet(
        &self,
        packet: Packet,
    ) -> impl Future<Output = Result<bool, ManagerError>> + Send;

    /// Wait handle that fires when the stream reaches a terminal state.
    fn terminated(&self) -> &Signal<ManagerError>;

    /// Move the stream to a cancelled terminal state.
    ///
    /// Idempotent; a no-op if the stream is already terminal.
    fn cancel(&self, reason: ManagerError);

    /// True iff the stream reached a non-cancelled terminal state.
    fn finished(&self) -> bool;
}
