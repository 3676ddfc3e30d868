use super::{BlockInfo, Handshake, PeerMessage, HANDSHAKE_LEN, PROTOCOL_STRING};
use crate::error::{BittorrentError, Result};
use bytes::{Buf, BytesMut};
use tracing::debug;

/// Default cap on a single framed message
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Incremental encoder/decoder for the peer wire protocol.
///
/// Decoding works on a growing buffer: a frame that has not fully arrived
/// yields `Ok(None)` and is left in place, so the caller reads more bytes and
/// tries again.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_message_len: usize,
}

impl WireCodec {
    pub fn new(max_message_len: usize) -> Self {
        Self { max_message_len }
    }

    pub fn decode_handshake(&self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // A wrong pstrlen is known from the first byte; fail before waiting for 68
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(BittorrentError::HandshakeMismatch(format!(
                "Unsupported protocol string length {}",
                buf[0]
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let frame = buf.split_to(HANDSHAKE_LEN);
        Handshake::from_bytes(&frame).map(Some)
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<PeerMessage>> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > self.max_message_len {
                return Err(BittorrentError::ProtocolViolation(format!(
                    "Message of {} bytes exceeds limit of {}",
                    length, self.max_message_len
                )));
            }

            if buf.len() < 4 + length {
                buf.reserve(4 + length - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            if length == 0 {
                return Ok(Some(PeerMessage::KeepAlive));
            }

            let mut frame = buf.split_to(length);
            let id = frame.get_u8();
            if let Some(message) = Self::parse(id, &mut frame)? {
                return Ok(Some(message));
            }
            debug!("Skipped unknown message ID {} ({} bytes)", id, length);
        }
    }

    pub fn encode(&self, message: &PeerMessage, buf: &mut BytesMut) {
        message.encode(buf);
    }

    /// `None` for IDs outside the base protocol
    fn parse(id: u8, frame: &mut BytesMut) -> Result<Option<PeerMessage>> {
        let payload = frame.len();
        let message = match id {
            PeerMessage::CHOKE => {
                expect_len(id, payload, 0)?;
                PeerMessage::Choke
            }
            PeerMessage::UNCHOKE => {
                expect_len(id, payload, 0)?;
                PeerMessage::Unchoke
            }
            PeerMessage::INTERESTED => {
                expect_len(id, payload, 0)?;
                PeerMessage::Interested
            }
            PeerMessage::NOT_INTERESTED => {
                expect_len(id, payload, 0)?;
                PeerMessage::NotInterested
            }
            PeerMessage::HAVE => {
                expect_len(id, payload, 4)?;
                PeerMessage::Have {
                    piece_index: frame.get_u32(),
                }
            }
            PeerMessage::BITFIELD => PeerMessage::Bitfield {
                bitfield: frame.split().freeze(),
            },
            PeerMessage::REQUEST | PeerMessage::CANCEL => {
                expect_len(id, payload, 12)?;
                let block = BlockInfo::new(frame.get_u32(), frame.get_u32(), frame.get_u32());
                if id == PeerMessage::REQUEST {
                    PeerMessage::Request { block }
                } else {
                    PeerMessage::Cancel { block }
                }
            }
            PeerMessage::PIECE => {
                if payload < 8 {
                    return Err(BittorrentError::ProtocolViolation(
                        "Piece message too short".to_string(),
                    ));
                }
                let piece_index = frame.get_u32();
                let offset = frame.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: frame.split().freeze(),
                }
            }
            PeerMessage::PORT => {
                expect_len(id, payload, 2)?;
                PeerMessage::Port {
                    port: frame.get_u16(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

fn expect_len(id: u8, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(BittorrentError::ProtocolViolation(format!(
            "Message ID {} has {} payload bytes, expected {}",
            id, actual, expected
        )));
    }
    Ok(())
}
