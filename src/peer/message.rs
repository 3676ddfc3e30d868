use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Largest block a peer may ask us for
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
    }
}

/// Messages exchanged between peers after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Raw bitfield of available pieces
    Bitfield { bitfield: Bytes },
    /// Request a block
    Request { block: BlockInfo },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a block request
    Cancel { block: BlockInfo },
    /// DHT listen port of the sender
    Port { port: u16 },
}

impl PeerMessage {
    /// Message type IDs
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;

    /// Append the wire form: <length prefix><message ID><payload>
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => Self::put_header(buf, Self::CHOKE, 0),
            PeerMessage::Unchoke => Self::put_header(buf, Self::UNCHOKE, 0),
            PeerMessage::Interested => Self::put_header(buf, Self::INTERESTED, 0),
            PeerMessage::NotInterested => Self::put_header(buf, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                Self::put_header(buf, Self::HAVE, 4);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(buf, Self::BITFIELD, bitfield.len());
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                Self::put_header(buf, Self::REQUEST, 12);
                block.put(buf);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(buf, Self::PIECE, 8 + data.len());
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                Self::put_header(buf, Self::CANCEL, 12);
                block.put(buf);
            }
            PeerMessage::Port { port } => {
                Self::put_header(buf, Self::PORT, 2);
                buf.put_u16(*port);
            }
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Total encoded size, including the length prefix
    pub fn wire_len(&self) -> usize {
        4 + match self {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { data, .. } => 9 + data.len(),
            PeerMessage::Port { .. } => 3,
        }
    }

    fn put_header(buf: &mut BytesMut, id: u8, payload_len: usize) {
        buf.reserve(5 + payload_len);
        buf.put_u32((1 + payload_len) as u32);
        buf.put_u8(id);
    }
}
