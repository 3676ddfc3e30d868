mod layout;

use layout::FileLayout;

use crate::error::{BittorrentError, Result};
use crate::peer::PeerKey;
use crate::piece::{sha1_digest, BLOCK_SIZE};
use crate::torrent::TorrentMeta;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Memory allowed for pieces still being assembled
pub const DEFAULT_BUFFER_LIMIT: u64 = 256 * 1024 * 1024;

/// Outcome of hashing an assembled piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Hash matched and the piece is on disk
    Verified,
    /// Hash mismatch; the buffered bytes were discarded
    Corrupt { contributors: Vec<PeerKey> },
}

/// A piece being assembled in memory
struct PendingPiece {
    data: Vec<u8>,
    received: Vec<bool>,
    contributors: Vec<PeerKey>,
}

impl PendingPiece {
    fn is_assembled(&self) -> bool {
        self.received.iter().all(|r| *r)
    }
}

/// On-disk piece storage.
///
/// Blocks are buffered per piece and only written once the whole piece
/// hashes correctly, so anything on disk is a verified piece (or the zero
/// fill of a fresh file).
pub struct PieceStore {
    meta: Arc<TorrentMeta>,
    layout: FileLayout,
    pending: HashMap<u32, PendingPiece>,
    /// Bytes allocated by `pending`
    buffered: u64,
    buffer_limit: u64,
    had_existing_data: bool,
}

impl PieceStore {
    /// Create the directory tree and size every file to its declared length
    pub async fn open<P: AsRef<Path>>(root: P, meta: Arc<TorrentMeta>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .await
            .map_err(|e| BittorrentError::storage(root.display(), e))?;

        let layout = FileLayout::new(root, &meta);
        let mut had_existing_data = false;

        for entry in layout.files() {
            if let Some(parent) = entry.path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BittorrentError::storage(parent.display(), e))?;
            }

            let existing = fs::metadata(&entry.path).await.map(|m| m.len()).ok();
            had_existing_data |= existing.is_some_and(|len| len > 0);

            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&entry.path)
                .await
                .map_err(|e| BittorrentError::storage(entry.path.display(), e))?;
            if existing != Some(entry.length) {
                file.set_len(entry.length)
                    .await
                    .map_err(|e| BittorrentError::storage(entry.path.display(), e))?;
            }
        }

        info!(
            "Storage ready: {} files, {} bytes total under {}",
            layout.files().len(),
            layout.total_length(),
            root.display()
        );

        Ok(Self {
            meta,
            layout,
            pending: HashMap::new(),
            buffered: 0,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            had_existing_data,
        })
    }

    pub fn with_buffer_limit(mut self, limit: u64) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Whether any file already held data when the store was opened
    pub fn had_existing_data(&self) -> bool {
        self.had_existing_data
    }

    /// Whether a block of `index` can be buffered without exceeding the limit.
    /// One piece is always allowed so a small limit cannot stall the download.
    pub fn can_buffer(&self, index: u32) -> bool {
        self.pending.contains_key(&index)
            || self.pending.is_empty()
            || self.buffered + self.meta.piece_len(index) as u64 <= self.buffer_limit
    }

    /// Buffer one block. Returns true once every block of the piece is in.
    pub fn write_block(&mut self, index: u32, offset: u32, data: &[u8], from: PeerKey) -> Result<bool> {
        let piece_len = self.meta.piece_len(index);
        if index as usize >= self.meta.num_pieces()
            || offset % BLOCK_SIZE != 0
            || data.len() as u32 != self.meta.block_len(index, offset)
            || data.is_empty()
        {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Block {}+{} ({} bytes) does not fit piece {}",
                index,
                offset,
                data.len(),
                index
            )));
        }

        let blocks = self.meta.block_count(index);
        let buffered = &mut self.buffered;
        let piece = self.pending.entry(index).or_insert_with(|| {
            *buffered += piece_len as u64;
            PendingPiece {
                data: vec![0u8; piece_len as usize],
                received: vec![false; blocks],
                contributors: Vec::new(),
            }
        });

        let start = offset as usize;
        piece.data[start..start + data.len()].copy_from_slice(data);
        piece.received[(offset / BLOCK_SIZE) as usize] = true;
        if !piece.contributors.contains(&from) {
            piece.contributors.push(from);
        }

        Ok(piece.is_assembled())
    }

    /// Hash an assembled piece and persist it on match
    pub async fn verify_piece(&mut self, index: u32) -> Result<Verification> {
        let piece = match self.pending.remove(&index) {
            Some(piece) if piece.is_assembled() => {
                self.buffered -= piece.data.len() as u64;
                piece
            }
            Some(piece) => {
                self.pending.insert(index, piece);
                return Err(BittorrentError::StorageError(format!(
                    "Piece {} verified before all blocks arrived",
                    index
                )));
            }
            None => {
                return Err(BittorrentError::StorageError(format!(
                    "Piece {} has no buffered data",
                    index
                )))
            }
        };

        match self.check(index, &piece.data) {
            Ok(()) => {
                self.write_at(index as u64 * self.meta.piece_length, &piece.data)
                    .await?;
                debug!("Piece {} verified and written", index);
                Ok(Verification::Verified)
            }
            Err(BittorrentError::IntegrityFailure { .. }) => {
                let peers: Vec<String> = piece.contributors.iter().map(|p| p.to_string()).collect();
                warn!(
                    "Piece {} failed hash check, contributed by {}",
                    index,
                    peers.join(", ")
                );
                Ok(Verification::Corrupt {
                    contributors: piece.contributors,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Read a block of a complete piece for upload
    pub async fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Bytes> {
        let piece_len = self.meta.piece_len(index);
        if index as usize >= self.meta.num_pieces()
            || length == 0
            || offset.checked_add(length).map_or(true, |end| end > piece_len)
        {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Request {}+{} ({} bytes) outside piece",
                index, offset, length
            )));
        }
        let start = index as u64 * self.meta.piece_length + offset as u64;
        self.read_at(start, length as usize).await.map(Bytes::from)
    }

    /// Hash every piece on disk; returns the indices that verify
    pub async fn scan_complete(&self) -> Result<Vec<u32>> {
        let mut complete = Vec::new();
        for index in 0..self.meta.num_pieces() as u32 {
            let start = index as u64 * self.meta.piece_length;
            let data = self.read_at(start, self.meta.piece_len(index) as usize).await?;
            if self.check(index, &data).is_ok() {
                complete.push(index);
            }
        }
        info!(
            "Resume scan found {}/{} pieces on disk",
            complete.len(),
            self.meta.num_pieces()
        );
        Ok(complete)
    }

    /// Sync every file to disk. Safe to call repeatedly.
    pub async fn flush(&self) -> Result<()> {
        for entry in self.layout.files() {
            let file = OpenOptions::new()
                .write(true)
                .open(&entry.path)
                .await
                .map_err(|e| BittorrentError::storage(entry.path.display(), e))?;
            file.sync_all()
                .await
                .map_err(|e| BittorrentError::storage(entry.path.display(), e))?;
        }
        Ok(())
    }

    fn check(&self, index: u32, data: &[u8]) -> Result<()> {
        match self.meta.piece_hash(index) {
            Some(expected) if sha1_digest(data) == *expected => Ok(()),
            _ => Err(BittorrentError::IntegrityFailure { index }),
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut cursor = 0;
        for span in self.layout.spans(offset, data.len()) {
            let path = self.layout.path(span.file);
            let mut file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;

            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;
            file.write_all(&data[cursor..cursor + span.len])
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;
            file.flush()
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;

            cursor += span.len;
        }
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(len);
        for span in self.layout.spans(offset, len) {
            let path = self.layout.path(span.file);
            let mut file = fs::File::open(path)
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;
            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;

            let mut buffer = vec![0u8; span.len];
            file.read_exact(&mut buffer)
                .await
                .map_err(|e| BittorrentError::storage(path.display(), e))?;
            result.extend_from_slice(&buffer);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileInfo;
    use tempfile::TempDir;

    /// Two files (20 KiB + 28 KiB) cut into 3 pieces of 16 KiB
    fn sample() -> (Arc<TorrentMeta>, Vec<u8>) {
        let content: Vec<u8> = (0..48 * 1024).map(|i| (i % 251) as u8).collect();
        let hashes = content.chunks(16 * 1024).map(sha1_digest).collect();
        let files = vec![
            FileInfo { path: vec!["set".into(), "a.bin".into()], length: 20 * 1024 },
            FileInfo { path: vec!["set".into(), "b.bin".into()], length: 28 * 1024 },
        ];
        let meta = TorrentMeta::new("set".into(), 16 * 1024, files, hashes, [9u8; 20]).unwrap();
        (Arc::new(meta), content)
    }

    fn piece(content: &[u8], index: usize) -> &[u8] {
        &content[index * 16 * 1024..(index + 1) * 16 * 1024]
    }

    #[tokio::test]
    async fn test_open_sizes_files() {
        let temp = TempDir::new().unwrap();
        let (meta, _) = sample();
        let store = PieceStore::open(temp.path(), meta).await.unwrap();
        assert!(!store.had_existing_data());

        let a = tokio::fs::metadata(temp.path().join("set/a.bin")).await.unwrap();
        let b = tokio::fs::metadata(temp.path().join("set/b.bin")).await.unwrap();
        assert_eq!(a.len(), 20 * 1024);
        assert_eq!(b.len(), 28 * 1024);
    }

    #[tokio::test]
    async fn test_verified_piece_spans_files() {
        let temp = TempDir::new().unwrap();
        let (meta, content) = sample();
        let mut store = PieceStore::open(temp.path(), meta).await.unwrap();

        // Piece 1 covers a.bin[16K..20K] and b.bin[0..12K]
        assert!(store.write_block(1, 0, piece(&content, 1), PeerKey(1)).unwrap());
        assert_eq!(store.verify_piece(1).await.unwrap(), Verification::Verified);

        let a = tokio::fs::read(temp.path().join("set/a.bin")).await.unwrap();
        let b = tokio::fs::read(temp.path().join("set/b.bin")).await.unwrap();
        assert_eq!(&a[16 * 1024..], &content[16 * 1024..20 * 1024]);
        assert_eq!(&b[..12 * 1024], &content[20 * 1024..32 * 1024]);

        let block = store.read_block(1, 100, 5000).await.unwrap();
        assert_eq!(&block[..], &content[16 * 1024 + 100..16 * 1024 + 5100]);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_never_written() {
        let temp = TempDir::new().unwrap();
        let (meta, content) = sample();
        let mut store = PieceStore::open(temp.path(), meta).await.unwrap();

        let mut bad = piece(&content, 0).to_vec();
        bad[10] ^= 0xFF;
        store.write_block(0, 0, &bad, PeerKey(4)).unwrap();
        assert_eq!(
            store.verify_piece(0).await.unwrap(),
            Verification::Corrupt { contributors: vec![PeerKey(4)] }
        );

        let a = tokio::fs::read(temp.path().join("set/a.bin")).await.unwrap();
        assert!(a[..16 * 1024].iter().all(|b| *b == 0));
        // Buffer was discarded
        assert!(store.verify_piece(0).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_misaligned_block() {
        let temp = TempDir::new().unwrap();
        let (meta, content) = sample();
        let mut store = PieceStore::open(temp.path(), meta).await.unwrap();
        assert!(matches!(
            store.write_block(0, 5, &content[..100], PeerKey(1)),
            Err(BittorrentError::ProtocolViolation(_))
        ));
        assert!(store.write_block(7, 0, &content[..100], PeerKey(1)).is_err());
    }

    #[tokio::test]
    async fn test_buffer_limit_caps_pending_pieces() {
        let temp = TempDir::new().unwrap();
        let (meta, content) = sample();
        let mut store = PieceStore::open(temp.path(), meta)
            .await
            .unwrap()
            .with_buffer_limit(20 * 1024);

        // The first piece always fits, a second would exceed 20 KiB
        assert!(store.can_buffer(0));
        store.write_block(0, 0, piece(&content, 0), PeerKey(1)).unwrap();
        assert!(store.can_buffer(0));
        assert!(!store.can_buffer(1));

        assert_eq!(store.verify_piece(0).await.unwrap(), Verification::Verified);
        assert!(store.can_buffer(1));
    }

    #[tokio::test]
    async fn test_resume_scan_finds_verified_pieces() {
        let temp = TempDir::new().unwrap();
        let (meta, content) = sample();
        {
            let mut store = PieceStore::open(temp.path(), meta.clone()).await.unwrap();
            store.write_block(0, 0, piece(&content, 0), PeerKey(1)).unwrap();
            store.verify_piece(0).await.unwrap();
            store.write_block(2, 0, piece(&content, 2), PeerKey(1)).unwrap();
            store.verify_piece(2).await.unwrap();
            store.flush().await.unwrap();
            store.flush().await.unwrap();
        }

        let store = PieceStore::open(temp.path(), meta).await.unwrap();
        assert!(store.had_existing_data());
        assert_eq!(store.scan_complete().await.unwrap(), vec![0, 2]);
    }
}
