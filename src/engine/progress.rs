use crate::peer::{PeerState, SessionState};
use crate::piece::Bitfield;
use crate::torrent::TorrentMeta;
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineStatus {
    /// Created, not started yet
    Idle,
    Downloading,
    Seeding,
    Paused,
    /// No connected or connecting peer can supply a missing piece
    Stalled,
    Failed(String),
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerProgress {
    pub addr: SocketAddr,
    /// Hex peer id, known once the handshake completes
    pub peer_id: Option<String>,
    pub state: SessionState,
    /// Share of the torrent the peer has announced, 0.0 to 1.0
    pub completion: f64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub flags: PeerState,
    pub outstanding: usize,
}

/// Snapshot returned by progress queries
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: EngineStatus,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub pieces_completed: usize,
    pub pieces_total: usize,
    pub bitfield: Bitfield,
    /// Payload bytes received, including discarded duplicates
    pub downloaded: u64,
    pub uploaded: u64,
    pub peers: Vec<PeerProgress>,
}

impl Progress {
    pub fn initial(meta: &TorrentMeta) -> Self {
        Self {
            status: EngineStatus::Idle,
            bytes_completed: 0,
            bytes_total: meta.total_length,
            pieces_completed: 0,
            pieces_total: meta.num_pieces(),
            bitfield: Bitfield::new(meta.num_pieces()),
            downloaded: 0,
            uploaded: 0,
            peers: Vec::new(),
        }
    }

    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_completed as f64 * 100.0 / self.bytes_total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_completed == self.pieces_total
    }
}
