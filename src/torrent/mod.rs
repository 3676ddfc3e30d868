mod magnet;
mod metainfo;

pub use metainfo::{FileInfo, TorrentMeta, MAX_PIECE_LENGTH};

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<TorrentMeta> {
    let data = fs::read(path).await?;
    parse_torrent(&data)
}

/// Parse torrent data from bytes
pub fn parse_torrent(data: &[u8]) -> Result<TorrentMeta> {
    TorrentMeta::from_bytes(data)
}
