mod availability;
mod bitfield;
mod picker;

pub use availability::BitfieldTracker;
pub use bitfield::Bitfield;
pub use picker::{Delivery, PieceSelector, SelectionPolicy};

use serde::Serialize;
use sha1::{Digest, Sha1};

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Download state of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PieceState {
    /// No block received or in flight
    Missing,
    /// Some blocks in flight or received
    Requested,
    /// Every block received, hash check pending
    Verifying,
    /// Hash verified and written to disk
    Complete,
}

pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}
