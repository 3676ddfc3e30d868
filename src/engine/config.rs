use crate::error::{BittorrentError, Result};
use crate::peer::DEFAULT_MAX_MESSAGE_LEN;
use crate::piece::{SelectionPolicy, BLOCK_SIZE};
use crate::storage::DEFAULT_BUFFER_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one torrent engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    /// Accept inbound peers on this port
    pub listen_port: Option<u16>,
    pub max_peers: usize,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    /// Peers unchoked by rate each cycle, not counting the optimistic slot
    pub unchoke_slots: usize,
    /// Rotate the optimistic unchoke every N choke cycles
    pub optimistic_unchoke_every: u64,
    pub choke_interval: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// A block request unanswered for this long is given to another peer
    pub request_timeout: Duration,
    pub endgame_pieces: usize,
    pub endgame_fraction: f64,
    pub max_message_len: usize,
    /// Memory for pieces still being assembled
    pub max_buffered_bytes: u64,
    pub rate_window: Duration,
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: None,
            max_peers: 50,
            pipeline_depth: 10,
            unchoke_slots: 4,
            optimistic_unchoke_every: 3,
            choke_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            endgame_pieces: 4,
            endgame_fraction: 0.05,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            max_buffered_bytes: DEFAULT_BUFFER_LIMIT,
            rate_window: Duration::from_secs(20),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("choke_interval", self.choke_interval),
            ("tick_interval", self.tick_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("idle_timeout", self.idle_timeout),
            ("rate_window", self.rate_window),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(BittorrentError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.pipeline_depth == 0 {
            return Err(BittorrentError::InvalidConfig("pipeline_depth must be positive".into()));
        }
        if self.optimistic_unchoke_every == 0 {
            return Err(BittorrentError::InvalidConfig(
                "optimistic_unchoke_every must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.endgame_fraction) {
            return Err(BittorrentError::InvalidConfig(format!(
                "endgame_fraction {} outside 0..=1",
                self.endgame_fraction
            )));
        }
        Ok(())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            pipeline_depth: self.pipeline_depth,
            endgame_pieces: self.endgame_pieces,
            endgame_fraction: self.endgame_fraction,
        }
    }

    /// Message size cap, raised so a full bitfield or block always fits
    pub fn message_limit(&self, piece_count: usize) -> usize {
        let bitfield = 1 + piece_count.div_ceil(8);
        let piece = 9 + BLOCK_SIZE as usize;
        self.max_message_len.max(bitfield).max(piece)
    }
}
