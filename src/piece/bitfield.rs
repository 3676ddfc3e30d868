use crate::error::{BittorrentError, Result};
use serde::Serialize;

/// Which pieces a party has. Bit 0 is the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parse a bitfield received from a peer. The length must match the
    /// torrent exactly and the spare trailing bits must be clear.
    pub fn from_wire(bytes: &[u8], piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Bitfield is {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }

        let spare = expected * 8 - piece_count;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(BittorrentError::ProtocolViolation(
                    "Bitfield has spare bits set".to_string(),
                ));
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self::new(piece_count);
        for index in 0..piece_count {
            bf.set(index);
        }
        bf
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Returns true if the bit was newly set
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
