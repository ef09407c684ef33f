//! Packet framing over a byte-oriented transport.
//!
//! A packet is encoded as a fixed little-endian header followed by the
//! payload:
//!
//! ```text
//! kind: u8 | stream: u64 | message: u64 | len: u32 | payload: len bytes
//! ```
//!
//! [`PacketReader`] owns the read half of the transport and is driven by a
//! single task. [`PacketWriter`] is a clonable handle over the write half;
//! writes are buffered and flushed at packet granularity by the streams that
//! share it. Both observe a close token: closing the transport fails pending
//! reads and writes with [`TransportError::Closed`].

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::{FrameError, Kind, Packet, PacketId, TransportError};

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 21;

/// Default capacity of the writer's staging buffer.
pub const DEFAULT_WRITER_BUFFER: usize = 1024;

const DEFAULT_MAX_PACKET_SIZE: u32 = 4 * 1024 * 1024;

fn max_packet_size() -> u32 {
    std::env::var("WIREMUX_MAX_PACKET_SIZE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PACKET_SIZE)
}

pub(crate) fn writer_buffer() -> usize {
    std::env::var("WIREMUX_WRITER_BUFFER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_WRITER_BUFFER)
}

/// Reads framed packets from the read half of a transport.
pub struct PacketReader {
    src: Box<dyn AsyncRead + Send + Unpin>,
    closed: CancellationToken,
}

impl PacketReader {
    /// Wrap the read half of a transport.
    pub fn new<R>(src: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_token(Box::new(src), CancellationToken::new())
    }

    pub(crate) fn with_token(
        src: Box<dyn AsyncRead + Send + Unpin>,
        closed: CancellationToken,
    ) -> Self {
        Self { src, closed }
    }

    /// Read the next packet.
    ///
    /// Any error is terminal for the reader. A clean end of stream before the
    /// first header byte is reported as [`TransportError::Closed`]; an end of
    /// stream inside a frame is a [`FrameError::UnexpectedEof`].
    pub async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let closed = self.closed.clone();
        tokio::select! {
            _ = closed.cancelled() => Err(TransportError::Closed),
            packet = read_packet_inner(&mut self.src) => packet,
        }
    }
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader").finish_non_exhaustive()
    }
}

async fn read_packet_inner<R>(src: &mut R) -> Result<Packet, TransportError>
where
    R: AsyncRead + Unpin,
{
    let kind_byte = src.read_u8().await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::from(e)
        }
    })?;

    let mut header = [0u8; HEADER_LEN - 1];
    src.read_exact(&mut header).await.map_err(map_frame_eof)?;

    let mut header = &header[..];
    let stream = header.get_u64_le();
    let message = header.get_u64_le();
    let len = header.get_u32_le();

    let kind = Kind::from_u8(kind_byte).ok_or(FrameError::UnknownKind(kind_byte))?;
    let max = max_packet_size();
    if len > max {
        return Err(FrameError::PayloadTooLarge {
            len: u64::from(len),
            max: u64::from(max),
        }
        .into());
    }

    let mut data = vec![0u8; len as usize];
    src.read_exact(&mut data).await.map_err(map_frame_eof)?;

    Ok(Packet {
        kind,
        id: PacketId::new(stream, message),
        data: Bytes::from(data),
    })
}

fn map_frame_eof(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::UnexpectedEof.into()
    } else {
        e.into()
    }
}

/// Writes framed packets to the write half of a transport.
///
/// Cloning hands out another handle to the same buffered writer; packets are
/// serialised at packet granularity by the internal lock.
#[derive(Clone)]
pub struct PacketWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    state: AsyncMutex<WriterState>,
    closed: CancellationToken,
}

struct WriterState {
    dst: Box<dyn AsyncWrite + Send + Unpin>,
    buf: BytesMut,
    capacity: usize,
}

impl PacketWriter {
    /// Wrap the write half of a transport with the given staging capacity.
    pub fn new<W>(dst: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_token(Box::new(dst), capacity, CancellationToken::new())
    }

    pub(crate) fn with_token(
        dst: Box<dyn AsyncWrite + Send + Unpin>,
        capacity: usize,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                state: AsyncMutex::new(WriterState {
                    dst,
                    buf: BytesMut::with_capacity(capacity),
                    capacity,
                }),
                closed,
            }),
        }
    }

    /// Append one packet to the staging buffer, flushing if it fills up.
    pub async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(TransportError::Closed),
            result = async {
                let mut state = self.inner.state.lock().await;
                encode_packet(&mut state.buf, packet)?;
                if state.buf.len() >= state.capacity {
                    flush_state(&mut state).await?;
                }
                Ok(())
            } => result,
        }
    }

    /// Flush any buffered bytes to the transport.
    pub async fn flush(&self) -> Result<(), TransportError> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(TransportError::Closed),
            result = async {
                let mut state = self.inner.state.lock().await;
                flush_state(&mut state).await
            } => result,
        }
    }

    /// Close the transport's write side.
    ///
    /// Idempotent; pending reads and writes sharing this writer's close token
    /// fail with [`TransportError::Closed`] before the shutdown completes.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.cancel();
        let mut state = self.inner.state.lock().await;
        state.buf.clear();
        state.dst.shutdown().await.map_err(TransportError::from)
    }
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}

fn encode_packet(buf: &mut BytesMut, packet: &Packet) -> Result<(), TransportError> {
    let len = packet.data.len();
    let max = max_packet_size();
    if len > max as usize {
        return Err(FrameError::PayloadTooLarge {
            len: len as u64,
            max: u64::from(max),
        }
        .into());
    }

    buf.reserve(HEADER_LEN + len);
    buf.put_u8(packet.kind as u8);
    buf.put_u64_le(packet.id.stream);
    buf.put_u64_le(packet.id.message);
    buf.put_u32_le(len as u32);
    buf.put_slice(&packet.data);
    Ok(())
}

async fn flush_state(state: &mut WriterState) -> Result<(), TransportError> {
    if state.buf.is_empty() {
        return Ok(());
    }
    let data = state.buf.split();
    state.dst.write_all(&data).await?;
    state.dst.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn pipe() -> (PacketWriter, PacketReader) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let closed = CancellationToken::new();
        (
            PacketWriter::with_token(Box::new(a), 64, closed.clone()),
            PacketReader::with_token(Box::new(b), closed),
        )
    }

    fn message(stream: u64, message_id: u64, data: &[u8]) -> Packet {
        Packet::new(
            Kind::Message,
            PacketId::new(stream, message_id),
            Bytes::copy_from_slice(data),
        )
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (writer, mut reader) = pipe();

        let packet = message(3, 1, b"hello");
        writer.write_packet(&packet).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_small_packets_stay_buffered_until_flush() {
        let (writer, mut reader) = pipe();

        writer.write_packet(&message(1, 1, b"a")).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), reader.read_packet()).await;
        assert!(pending.is_err(), "packet should still be buffered");

        writer.flush().await.unwrap();
        assert_eq!(reader.read_packet().await.unwrap().data.as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_full_buffer_flushes_without_explicit_flush() {
        let (writer, mut reader) = pipe();

        let packet = message(1, 1, &[7u8; 128]);
        writer.write_packet(&packet).await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_clean_eof_reports_closed() {
        let (writer, mut reader) = pipe();
        drop(writer);

        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_unexpected_eof() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let mut reader = PacketReader::new(b);

        raw.write_all(&[Kind::Message as u8, 1, 2, 3]).await.unwrap();
        drop(raw);

        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Frame(FrameError::UnexpectedEof))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let mut reader = PacketReader::new(b);

        let mut frame = BytesMut::new();
        frame.put_u8(0x7f);
        frame.put_u64_le(1);
        frame.put_u64_le(1);
        frame.put_u32_le(0);
        raw.write_all(&frame).await.unwrap();

        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Frame(FrameError::UnknownKind(0x7f)))
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let mut reader = PacketReader::new(b);

        let mut frame = BytesMut::new();
        frame.put_u8(Kind::Message as u8);
        frame.put_u64_le(1);
        frame.put_u64_le(1);
        frame.put_u32_le(u32::MAX);
        raw.write_all(&frame).await.unwrap();

        assert!(matches!(
            reader.read_packet().await,
            Err(TransportError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_ops() {
        let (writer, mut reader) = pipe();

        let read = tokio::spawn(async move { reader.read_packet().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        writer.close().await.unwrap();

        assert!(matches!(
            read.await.unwrap(),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            writer.write_packet(&message(1, 1, b"late")).await,
            Err(TransportError::Closed)
        ));
    }
}
