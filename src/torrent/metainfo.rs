use crate::bencode::{decode, raw_dict_value, BencodeValue};
use crate::error::{BittorrentError, Result};
use crate::piece::{sha1_digest, BLOCK_SIZE};

/// Largest accepted piece; a piece is held in memory while it is assembled
pub const MAX_PIECE_LENGTH: u64 = 256 * 1024 * 1024;

/// A file in the torrent's layout. `path` is relative to the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

/// Immutable description of a torrent: geometry, hashes, file layout and
/// the info-hash identifying it on the wire.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    /// Tracker URLs are kept for display only
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// Seconds since the Unix epoch
    pub creation_date: Option<i64>,
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileInfo>,
    pub info_hash: [u8; 20],
}

impl TorrentMeta {
    /// Build metadata directly, e.g. from a resolved magnet link.
    pub fn new(
        name: String,
        piece_length: u64,
        files: Vec<FileInfo>,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: [u8; 20],
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(invalid("'piece length' must be positive"));
        }
        if piece_length > MAX_PIECE_LENGTH {
            return Err(BittorrentError::InvalidTorrent(format!(
                "'piece length' {} exceeds {}",
                piece_length, MAX_PIECE_LENGTH
            )));
        }
        if files.is_empty() {
            return Err(invalid("Torrent has no files"));
        }
        for file in &files {
            validate_path(&file.path)?;
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            return Err(invalid("Torrent is empty"));
        }

        let expected = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(BittorrentError::InvalidTorrent(format!(
                "Expected {} piece hashes, found {}",
                expected,
                piece_hashes.len()
            )));
        }
        if expected > u32::MAX as u64 {
            return Err(invalid("Too many pieces"));
        }

        Ok(Self {
            name,
            announce: None,
            announce_list: Vec::new(),
            comment: None,
            created_by: None,
            creation_date: None,
            piece_length,
            total_length,
            piece_hashes,
            files,
            info_hash,
        })
    }

    /// Parse a bencoded metainfo document. The info-hash is taken over the
    /// raw `info` bytes so re-encoding quirks cannot change it.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(invalid("Torrent must be a dict"));
        }

        let raw_info = raw_dict_value(data, b"info")?
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        let info = root
            .get(b"info")
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        if info.as_dict().is_none() {
            return Err(invalid("Info must be a dict"));
        }

        let name = info
            .get(b"name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("Missing 'name' field"))?
            .to_string();

        let piece_length = info
            .get(b"piece length")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| invalid("Missing 'piece length' field"))?;

        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("Missing 'pieces' field"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("Pieces length must be multiple of 20"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = parse_files(info, &name)?;
        let info_hash = sha1_digest(raw_info);

        let mut meta = Self::new(name, piece_length, files, piece_hashes, info_hash)?;

        meta.announce = root
            .get(b"announce")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.announce_list = root
            .get(b"announce-list")
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| tier.as_list())
                    .map(|urls| urls.iter().filter_map(|u| u.as_str().map(String::from)).collect())
                    .collect()
            })
            .unwrap_or_default();
        meta.comment = root.get(b"comment").and_then(|v| v.as_str()).map(String::from);
        meta.created_by = root
            .get(b"created by")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.creation_date = root.get(b"creation date").and_then(|v| v.as_integer());

        Ok(meta)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of a piece; the last one may be short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        self.total_length
            .saturating_sub(start)
            .min(self.piece_length) as u32
    }

    pub fn block_count(&self, index: u32) -> usize {
        (self.piece_len(index) as usize).div_ceil(BLOCK_SIZE as usize)
    }

    /// Length of the block starting at `offset`; the last block of the last
    /// piece may be short.
    pub fn block_len(&self, index: u32, offset: u32) -> u32 {
        self.piece_len(index).saturating_sub(offset).min(BLOCK_SIZE)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn parse_files(info: &BencodeValue, name: &str) -> Result<Vec<FileInfo>> {
    if let Some(length) = info.get(b"length") {
        let length = length
            .as_u64()
            .ok_or_else(|| invalid("Invalid 'length' field"))?;
        return Ok(vec![FileInfo {
            path: vec![name.to_string()],
            length,
        }]);
    }

    let list = info
        .get(b"files")
        .and_then(|v| v.as_list())
        .ok_or_else(|| invalid("Missing 'length' or 'files' field"))?;

    list.iter()
        .map(|entry| {
            let length = entry
                .get(b"length")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| invalid("Missing file 'length'"))?;
            let components = entry
                .get(b"path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| invalid("Missing file 'path'"))?;

            let mut path = vec![name.to_string()];
            for component in components {
                let part = component
                    .as_str()
                    .ok_or_else(|| invalid("Invalid path component"))?;
                path.push(part.to_string());
            }
            Ok(FileInfo { path, length })
        })
        .collect()
}

fn validate_path(path: &[String]) -> Result<()> {
    if path.is_empty() {
        return Err(invalid("Empty file path"));
    }
    for part in path {
        if part.is_empty()
            || part == "."
            || part == ".."
            || part.contains('/')
            || part.contains('\\')
        {
            return Err(BittorrentError::InvalidTorrent(format!(
                "Unsafe path component: {:?}",
                part
            )));
        }
    }
    Ok(())
}

fn invalid(msg: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.to_string())
}
