mod codec;
mod message;
mod protocol;
mod rate;
mod session;

pub use codec::{WireCodec, DEFAULT_MAX_MESSAGE_LEN};
pub use message::{BlockInfo, PeerMessage, MAX_REQUEST_LEN};
pub use protocol::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use rate::RateEstimator;
pub use session::{PeerEvent, PeerSession, SessionCommand, SessionContext, SessionEvent};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable engine-assigned identity of a peer session. Shared structures are
/// keyed by this, never by a reference to the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(pub u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    HandshakePending,
    Active,
    Closing,
    Closed,
}

// Peer connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Generate a random peer ID
/// Format: -BE0001-<12 random chars>
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-BE0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'z');
    }

    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-BE0001-");
        assert!(peer_id[8..].iter().all(|b| (b'0'..=b'z').contains(b)));
        assert_ne!(generate_peer_id(), peer_id);
    }

    #[test]
    fn test_initial_flags_are_choked_and_uninterested() {
        let state = PeerState::default();
        assert!(state.am_choking && state.peer_choking);
        assert!(!state.am_interested && !state.peer_interested);
    }
}
