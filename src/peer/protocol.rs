use crate::error::{BittorrentError, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Parse a complete handshake. Only the protocol string is checked
    /// here; the info-hash comparison belongs to the session.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(BittorrentError::ProtocolViolation(
                "Handshake too short".to_string(),
            ));
        }

        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(BittorrentError::HandshakeMismatch(
                "Unsupported protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}
