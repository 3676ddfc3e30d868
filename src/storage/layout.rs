use crate::torrent::TorrentMeta;
use std::path::{Path, PathBuf};

/// A contiguous run of bytes inside one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file: usize,
    pub file_offset: u64,
    pub len: usize,
}

#[derive(Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    /// Global offset in the torrent
    pub offset: u64,
}

/// Maps the torrent's flat byte space onto its files
#[derive(Debug)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    total_length: u64,
}

impl FileLayout {
    pub fn new(root: &Path, meta: &TorrentMeta) -> Self {
        let mut offset = 0u64;
        let files = meta
            .files
            .iter()
            .map(|info| {
                let mut path = root.to_path_buf();
                for component in &info.path {
                    path.push(component);
                }
                let entry = FileEntry {
                    path,
                    length: info.length,
                    offset,
                };
                offset += info.length;
                entry
            })
            .collect();

        Self {
            files,
            total_length: offset,
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn path(&self, file: usize) -> &Path {
        &self.files[file].path
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Split `len` bytes starting at global `offset` into per-file runs.
    /// Zero-length files never appear. A range past the end is truncated.
    pub fn spans(&self, mut offset: u64, len: usize) -> Vec<FileSpan> {
        let mut remaining = len as u64;
        let mut spans = Vec::new();

        for (index, entry) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let end = entry.offset + entry.length;
            if offset >= end {
                continue;
            }

            let file_offset = offset - entry.offset;
            let n = remaining.min(end - offset);
            spans.push(FileSpan {
                file: index,
                file_offset,
                len: n as usize,
            });

            offset += n;
            remaining -= n;
        }

        spans
    }
}
