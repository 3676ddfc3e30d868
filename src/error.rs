use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    /// Transient transport failure, local to one peer.
    #[error("Peer connection error: {0}")]
    ConnectionError(String),

    /// Malformed or oversized message from a peer.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("Piece {index} failed hash verification")]
    IntegrityFailure { index: u32 },

    /// Disk full or unwritable. Fatal to the engine instance.
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine is not running")]
    EngineStopped,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BittorrentError {
    /// Errors that never escape the teardown of the session that raised them.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            BittorrentError::ConnectionError(_)
                | BittorrentError::ProtocolViolation(_)
                | BittorrentError::HandshakeMismatch(_)
        )
    }

    /// Peers that misbehaved rather than merely dropped off.
    pub fn is_misbehaviour(&self) -> bool {
        matches!(
            self,
            BittorrentError::ProtocolViolation(_) | BittorrentError::HandshakeMismatch(_)
        )
    }

    pub(crate) fn connection(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        BittorrentError::ConnectionError(format!("{}: {}", context, err))
    }

    pub(crate) fn storage(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        BittorrentError::StorageError(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_local_classification() {
        assert!(BittorrentError::ConnectionError("reset".into()).is_peer_local());
        assert!(BittorrentError::ProtocolViolation("len".into()).is_peer_local());
        assert!(BittorrentError::HandshakeMismatch("hash".into()).is_misbehaviour());
        assert!(!BittorrentError::ConnectionError("reset".into()).is_misbehaviour());
        assert!(!BittorrentError::StorageError("full".into()).is_peer_local());
        assert!(!BittorrentError::IntegrityFailure { index: 3 }.is_peer_local());
        assert!(!BittorrentError::InvalidConfig("tick".into()).is_peer_local());
    }
}
