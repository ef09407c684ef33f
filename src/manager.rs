//! The connection manager.
//!
//! A [`Manager`] owns one transport and arbitrates it between logical
//! streams. Four kinds of task cooperate:
//!
//! - the manager itself holds the signals, the single-stream semaphore and
//!   the packet queue, and exposes stream creation and close;
//! - the transport supervisor waits for the terminate signal, closes the
//!   transport and records the result;
//! - the reader pump continuously reads framed packets and hands them to
//!   whichever consumer currently owns the queue;
//! - a per-stream supervisor pair (packet forwarder + cancellation watcher)
//!   routes packets into the live stream and propagates cancellation.
//!
//! # Key invariant
//!
//! At most one stream is live at a time. The semaphore's single permit is
//! held from stream creation until the stream supervisor exits, and the
//! queue has exactly one consumer at any moment: either a server accept
//! call or the forwarder of the live stream.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::wire::writer_buffer;
use crate::{
    Kind, ManagerError, Packet, PacketReader, PacketWriter, RpcStream, Signal, Stream,
    TransportError,
};

struct Shared {
    writer: PacketWriter,
    /// Incoming packets from the reader pump. The pump owns the only sender;
    /// consumer exclusivity is enforced by `sem`, not by this lock alone.
    queue: AsyncMutex<mpsc::Receiver<Packet>>,
    /// The single-stream admission gate. Exactly one permit, ever.
    sem: Semaphore,
    /// Client stream id counter; the first assigned id is 1.
    sid: AtomicU64,
    /// Set when the manager should start terminating; carries the cause.
    term: Signal<ManagerError>,
    /// Set once the reader pump has exited.
    read_done: Signal<ManagerError>,
    /// Set once the transport has been closed; carries the close result.
    transport_closed: Signal<Result<(), TransportError>>,
    close_once: OnceCell<Result<(), TransportError>>,
}

/// Multiplexes a bidirectional RPC protocol over a single transport.
///
/// `S` is the stream implementation handed to callers; it defaults to
/// [`RpcStream`].
pub struct Manager<S: Stream = RpcStream> {
    shared: Arc<Shared>,
    _stream: PhantomData<fn() -> S>,
}

impl<S: Stream> Manager<S> {
    /// Wrap a transport and start managing it.
    ///
    /// Spawns the transport supervisor and the reader pump immediately.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let closed = CancellationToken::new();
        let reader = PacketReader::with_token(Box::new(read_half), closed.clone());
        let writer = PacketWriter::with_token(Box::new(write_half), writer_buffer(), closed);

        let (packets_tx, packets_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            writer: writer.clone(),
            queue: AsyncMutex::new(packets_rx),
            sem: Semaphore::new(1),
            sid: AtomicU64::new(0),
            term: Signal::new(),
            read_done: Signal::new(),
            transport_closed: Signal::new(),
            close_once: OnceCell::new(),
        });

        tokio::spawn(run_transport(shared.clone(), writer));
        tokio::spawn(run_reader(shared.clone(), reader, packets_tx));

        Self {
            shared,
            _stream: PhantomData,
        }
    }

    /// Whether the manager has started terminating.
    pub fn closed(&self) -> bool {
        self.shared.term.is_set()
    }

    /// Close the manager and drain its tasks.
    ///
    /// Idempotent and safe under concurrent callers: the first caller runs
    /// the shutdown protocol, every caller blocks until it completes and
    /// returns the same transport close result.
    pub async fn close(&self) -> Result<(), TransportError> {
        let shared = &self.shared;
        shared
            .close_once
            .get_or_init(|| async {
                shared.term.set(ManagerError::Closed);
                // Close order is load-bearing: close the transport first so
                // anything blocked on transport I/O fails out and observes
                // term, then take the stream slot to wait out a live stream
                // supervisor, then wait for the reader pump to exit.
                let result = shared.transport_closed.wait().await;
                if let Ok(permit) = shared.sem.acquire().await {
                    permit.forget();
                }
                shared.read_done.wait().await;
                result
            })
            .await
            .clone()
    }

    /// Open a stream initiated by this side.
    ///
    /// Blocks until the connection's stream slot is free, `ctx` is
    /// cancelled, or the manager terminates.
    pub async fn new_client_stream(&self, ctx: &CancellationToken) -> Result<Arc<S>, ManagerError> {
        self.acquire_stream_slot(ctx).await?;

        let sid = self.shared.sid.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = Arc::new(S::open(sid, self.shared.writer.clone()));
        tracing::debug!(stream_id = sid, "client stream opened");
        spawn_supervisor(self.shared.clone(), ctx.clone(), stream.clone());
        Ok(stream)
    }

    /// Wait for the remote to invoke a stream.
    ///
    /// Returns the stream and the invoked RPC name. On cancellation or
    /// termination while waiting, the stream slot is released before the
    /// error is returned, so callers may immediately retry.
    pub async fn new_server_stream(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(Arc<S>, String), ManagerError> {
        self.acquire_stream_slot(ctx).await?;

        let shared = &self.shared;
        let mut queue = shared.queue.lock().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    drop(queue);
                    shared.sem.add_permits(1);
                    return Err(ManagerError::Cancelled);
                }
                err = shared.term.wait() => {
                    drop(queue);
                    shared.sem.add_permits(1);
                    return Err(err);
                }
                packet = queue.recv() => {
                    let Some(packet) = packet else {
                        // The pump sets term before dropping its sender.
                        let err = shared.term.get().unwrap_or(ManagerError::Closed);
                        drop(queue);
                        shared.sem.add_permits(1);
                        return Err(err);
                    };

                    // Anything but an invoke here is a stale frame of a prior
                    // stream whose peer had not yet observed it finish.
                    if packet.kind != Kind::Invoke {
                        tracing::debug!(
                            stream_id = packet.id.stream,
                            kind = ?packet.kind,
                            "discarding stale packet while accepting"
                        );
                        continue;
                    }

                    let rpc = String::from_utf8_lossy(&packet.data).into_owned();
                    let stream = Arc::new(S::open(packet.id.stream, shared.writer.clone()));
                    tracing::debug!(stream_id = packet.id.stream, rpc = %rpc, "server stream opened");
                    drop(queue);
                    spawn_supervisor(shared.clone(), ctx.clone(), stream.clone());
                    return Ok((stream, rpc));
                }
            }
        }
    }

    async fn acquire_stream_slot(&self, ctx: &CancellationToken) -> Result<(), ManagerError> {
        let shared = &self.shared;

        // Poll before selecting so cancellation that is already observable
        // wins deterministically over a free slot.
        if ctx.is_cancelled() {
            return Err(ManagerError::Cancelled);
        }
        if let Some(err) = shared.term.get() {
            return Err(err);
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(ManagerError::Cancelled),
            err = shared.term.wait() => Err(err),
            permit = shared.sem.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(ManagerError::Closed),
            },
        }
    }
}

impl<S: Stream> std::fmt::Debug for Manager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

/// Closes the transport once the terminate signal is observed and records
/// the result. The single point responsible for closing the transport.
async fn run_transport(shared: Arc<Shared>, writer: PacketWriter) {
    let cause = shared.term.wait().await;
    tracing::debug!(%cause, "closing transport");
    let result = writer.close().await;
    if let Err(err) = &result {
        tracing::debug!(%err, "transport close failed");
    }
    shared.transport_closed.set(result);
}

/// Continuously reads packets and feeds the queue. The sole sender on the
/// queue; any read error becomes the manager's terminating cause.
async fn run_reader(shared: Arc<Shared>, mut reader: PacketReader, packets: mpsc::Sender<Packet>) {
    loop {
        let packet = tokio::select! {
            _ = shared.term.wait() => break,
            read = reader.read_packet() => match read {
                Ok(packet) => packet,
                Err(err) => {
                    shared.term.set(ManagerError::Transport(err));
                    break;
                }
            },
        };

        tracing::trace!(
            stream_id = packet.id.stream,
            message_id = packet.id.message,
            kind = ?packet.kind,
            len = packet.data.len(),
            "packet received"
        );

        tokio::select! {
            _ = shared.term.wait() => break,
            sent = packets.send(packet) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    // Nothing reads from the transport once this is set.
    shared.read_done.set(ManagerError::Closed);
    tracing::debug!("reader pump exited");
}

/// Launches the per-stream supervisor pair and guarantees cleanup.
///
/// Whatever way the sub-tasks exit, the stream receives a final cancel and
/// the stream slot is released.
fn spawn_supervisor<S: Stream>(shared: Arc<Shared>, ctx: CancellationToken, stream: Arc<S>) {
    tokio::spawn(async move {
        let forwarder = tokio::spawn(forward_packets(shared.clone(), stream.clone()));
        let watcher = tokio::spawn(watch_cancellation(shared.clone(), ctx, stream.clone()));
        let _ = forwarder.await;
        let _ = watcher.await;

        // The stream is already terminal here unless the manager itself is
        // tearing down, in which case the transport died out from under it.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            stream.cancel(ManagerError::Cancelled);
        }));
        shared.sem.add_permits(1);
        tracing::debug!("stream supervisor exited");
    });
}

/// Forwards queued packets into the stream until it needs no more.
async fn forward_packets<S: Stream>(shared: Arc<Shared>, stream: Arc<S>) {
    let mut queue = shared.queue.lock().await;
    loop {
        let packet = tokio::select! {
            _ = shared.term.wait() => return,
            _ = stream.terminated().wait() => return,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        tracing::trace!(
            stream_id = packet.id.stream,
            kind = ?packet.kind,
            "forwarding packet"
        );

        // Handling races against term so the supervisor can always drain,
        // even when the stream's consumer has stopped taking packets.
        let handled = tokio::select! {
            _ = shared.term.wait() => return,
            handled = stream.handle_packet(packet) => handled,
        };

        match handled {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                // A stream that cannot handle a packet leaves the transport
                // in an indeterminate state; the whole connection goes down.
                shared.term.set(err);
                return;
            }
        }
    }
}

/// Propagates caller cancellation into the stream.
async fn watch_cancellation<S: Stream>(shared: Arc<Shared>, ctx: CancellationToken, stream: Arc<S>) {
    tokio::select! {
        _ = shared.term.wait() => {}
        _ = stream.terminated().wait() => {}
        _ = ctx.cancelled() => {
            stream.cancel(ManagerError::Cancelled);
            // A cancellation landing mid-RPC has no wire-level encoding in
            // this protocol; the transport is abandoned instead.
            if !stream.finished() {
                shared.term.set(ManagerError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Manager<RpcStream>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (Manager::new(near), far)
    }

    #[tokio::test]
    async fn test_already_cancelled_ctx_wins_over_a_free_slot() {
        let (manager, _far) = manager();
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(matches!(
            manager.new_client_stream(&ctx).await,
            Err(ManagerError::Cancelled)
        ));

        // The slot was never taken.
        let fresh = CancellationToken::new();
        let stream = manager.new_client_stream(&fresh).await.unwrap();
        assert_eq!(stream.id(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (manager, _far) = manager();
        assert!(manager.close().await.is_ok());
        assert!(manager.close().await.is_ok());
        assert!(manager.closed());
    }
}
