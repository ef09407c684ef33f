//! The default stream implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::{Kind, ManagerError, Packet, PacketId, PacketWriter, ProtocolError, Signal, Stream};

// Depth of the inbound message queue. Kept at one so a slow consumer applies
// back-pressure through the forwarder all the way to the transport reader.
const INBOUND_CAPACITY: usize = 1;

/// A message-oriented RPC stream.
///
/// Outgoing packets go through the connection's shared [`PacketWriter`] and
/// are flushed at packet granularity. Incoming `Message` payloads are queued
/// for [`recv`](RpcStream::recv); `Close` and `Error` packets end the stream.
pub struct RpcStream {
    id: u64,
    writer: PacketWriter,
    next_message: AtomicU64,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    terminated: Signal<ManagerError>,
    finished: AtomicBool,
}

impl RpcStream {
    /// The stream's id on the wire.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn next_id(&self) -> PacketId {
        PacketId::new(self.id, self.next_message.fetch_add(1, Ordering::Relaxed))
    }

    async fn write(&self, kind: Kind, data: Bytes) -> Result<(), ManagerError> {
        if self.terminated.is_set() {
            return Err(ManagerError::StreamClosed);
        }
        let packet = Packet::new(kind, self.next_id(), data);
        self.writer.write_packet(&packet).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send the invocation that begins this RPC on the remote.
    pub async fn invoke(&self, rpc: &str) -> Result<(), ManagerError> {
        self.write(Kind::Invoke, Bytes::copy_from_slice(rpc.as_bytes()))
            .await
    }

    /// Send one message to the remote.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ManagerError> {
        self.write(Kind::Message, data.into()).await
    }

    /// Receive the next message from the remote.
    ///
    /// Buffered messages are drained before termination is reported.
    /// `Ok(None)` means the remote closed the stream cleanly.
    pub async fn recv(&self) -> Result<Option<Bytes>, ManagerError> {
        let mut inbound = self.inbound_rx.lock().await;
        if let Ok(data) = inbound.try_recv() {
            return Ok(Some(data));
        }

        tokio::select! {
            data = inbound.recv() => Ok(data),
            reason = self.terminated.wait() => {
                // A message may have been queued concurrently with the
                // terminal transition; hand it out before reporting the end.
                if let Ok(data) = inbound.try_recv() {
                    return Ok(Some(data));
                }
                if self.finished() {
                    Ok(None)
                } else {
                    Err(reason)
                }
            }
        }
    }

    /// Close the stream cleanly, notifying the remote.
    pub async fn close(&self) -> Result<(), ManagerError> {
        if self.terminated.is_set() {
            return Ok(());
        }
        let packet = Packet::new(Kind::Close, self.next_id(), Bytes::new());
        self.writer.write_packet(&packet).await?;
        self.writer.flush().await?;
        self.finished.store(true, Ordering::Release);
        self.terminated.set(ManagerError::StreamClosed);
        Ok(())
    }
}

impl Stream for RpcStream {
    fn open(id: u64, writer: PacketWriter) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            id,
            writer,
            next_message: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            terminated: Signal::new(),
            finished: AtomicBool::new(false),
        }
    }

    async fn handle_packet(&self, packet: Packet) -> Result<bool, ManagerError> {
        // Frames for other streams can arrive after their own supervisor tore
        // down; they are dropped rather than treated as failures.
        if packet.id.stream != self.id {
            tracing::trace!(
                stream_id = self.id,
                packet_stream = packet.id.stream,
                "ignoring packet for another stream"
            );
            return Ok(true);
        }

        match packet.kind {
            Kind::Invoke => Err(ProtocolError::UnexpectedInvoke { stream: self.id }.into()),
            Kind::Message => {
                tokio::select! {
                    sent = self.inbound_tx.send(packet.data) => Ok(sent.is_ok()),
                    _ = self.terminated.wait() => Ok(false),
                }
            }
            Kind::Error => {
                let message = String::from_utf8_lossy(&packet.data).into_owned();
                self.terminated.set(ManagerError::Remote(message));
                Ok(false)
            }
            Kind::Close => {
                self.finished.store(true, Ordering::Release);
                self.terminated.set(ManagerError::StreamClosed);
                Ok(false)
            }
        }
    }

    fn terminated(&self) -> &Signal<ManagerError> {
        &self.terminated
    }

    fn cancel(&self, reason: ManagerError) {
        if self.terminated.set(reason) {
            tracing::debug!(stream_id = self.id, "stream cancelled");
        }
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id)
            .field("finished", &self.finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> RpcStream {
        RpcStream::open(4, PacketWriter::new(tokio::io::sink(), 64))
    }

    fn packet(kind: Kind, stream: u64, data: &[u8]) -> Packet {
        Packet::new(kind, PacketId::new(stream, 1), Bytes::copy_from_slice(data))
    }

    #[tokio::test]
    async fn test_message_is_delivered_to_recv() {
        let s = stream();
        assert!(s.handle_packet(packet(Kind::Message, 4, b"hi")).await.unwrap());
        assert_eq!(s.recv().await.unwrap().unwrap().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn test_packet_for_another_stream_is_ignored() {
        let s = stream();
        assert!(s.handle_packet(packet(Kind::Close, 9, b"")).await.unwrap());
        assert!(!s.terminated().is_set());
    }

    #[tokio::test]
    async fn test_remote_close_finishes_the_stream() {
        let s = stream();
        assert!(!s.handle_packet(packet(Kind::Close, 4, b"")).await.unwrap());
        assert!(s.finished());
        assert!(s.terminated().is_set());
        assert!(matches!(s.recv().await, Ok(None)));
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_through_recv() {
        let s = stream();
        assert!(!s
            .handle_packet(packet(Kind::Error, 4, b"boom"))
            .await
            .unwrap());
        assert!(!s.finished());
        match s.recv().await {
            Err(ManagerError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected recv result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_on_existing_stream_is_a_protocol_error() {
        let s = stream();
        assert!(matches!(
            s.handle_packet(packet(Kind::Invoke, 4, b"Echo")).await,
            Err(ManagerError::Protocol(ProtocolError::UnexpectedInvoke { stream: 4 }))
        ));
    }

    #[tokio::test]
    async fn test_buffered_message_drains_before_termination() {
        let s = stream();
        assert!(s.handle_packet(packet(Kind::Message, 4, b"last")).await.unwrap());
        s.cancel(ManagerError::Cancelled);

        assert_eq!(s.recv().await.unwrap().unwrap().as_ref(), b"last");
        assert!(matches!(s.recv().await, Err(ManagerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_after_cancel_fails() {
        let s = stream();
        s.cancel(ManagerError::Cancelled);
        assert!(matches!(
            s.send(Bytes::from_static(b"x")).await,
            Err(ManagerError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_first_writer_wins() {
        let s = stream();
        s.cancel(ManagerError::Cancelled);
        s.cancel(ManagerError::Closed);
        assert!(matches!(
            s.terminated().get(),
            Some(ManagerError::Cancelled)
        ));
    }
}
