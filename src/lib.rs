//! bittorrent-engine - a BitTorrent download and seeding engine
//!
//! - [`engine`] - `TorrentEngine`, the control surface: add peers, start,
//!   pause, progress and shutdown
//! - [`peer`] - wire codec and the per-connection session
//! - [`piece`] - bitfields, swarm availability and request scheduling
//! - [`choke`] - upload slot allocation
//! - [`storage`] - verified piece storage across the torrent's files
//! - [`torrent`] - metainfo parsing

pub mod bencode;
pub mod choke;
pub mod cli;
pub mod engine;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;

pub use engine::{EngineConfig, EngineStatus, PeerProgress, Progress, TorrentEngine};
pub use error::{BittorrentError, Result};
pub use torrent::{load_torrent_file, parse_torrent, FileInfo, TorrentMeta};
