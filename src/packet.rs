//! Packet data model.

use bytes::Bytes;

/// Packet kinds understood on the wire.
///
/// The manager interprets only [`Kind::Invoke`]; every other kind is opaque
/// pass-through to the active stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Begins a stream on the receiving side; the payload is the RPC name.
    Invoke = 1,
    /// Application data for the stream.
    Message = 2,
    /// The sending side failed the stream; the payload describes the error.
    Error = 3,
    /// The sending side finished the stream cleanly.
    Close = 4,
}

impl Kind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Invoke),
            2 => Some(Self::Message),
            3 => Some(Self::Error),
            4 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Identifies a packet within a connection.
///
/// Stream ids are assigned by whichever side initiated the stream; message
/// ids order packets within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketId {
    pub stream: u64,
    pub message: u64,
}

impl PacketId {
    pub fn new(stream: u64, message: u64) -> Self {
        Self { stream, message }
    }
}

/// A framed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: Kind,
    pub id: PacketId,
    pub data: Bytes,
}

impl Packet {
    pub fn new(kind: Kind, id: PacketId, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [Kind::Invoke, Kind::Message, Kind::Error, Kind::Close] {
            assert_eq!(Kind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(Kind::from_u8(0), None);
        assert_eq!(Kind::from_u8(5), None);
    }
}
