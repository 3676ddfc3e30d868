use super::{
    BlockInfo, Handshake, PeerKey, PeerMessage, PeerState, SessionState, WireCodec,
    MAX_REQUEST_LEN,
};
use crate::error::{BittorrentError, Result};
use crate::piece::Bitfield;
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 32 * 1024;

/// Per-torrent parameters every session needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub piece_count: usize,
    pub max_message_len: usize,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

/// Instructions from the engine to one session
#[derive(Debug)]
pub enum SessionCommand {
    Send(PeerMessage),
    /// Block data answering a request the peer made
    Upload { block: BlockInfo, data: Bytes },
    Close,
}

/// What a session reports back to the engine
#[derive(Debug)]
pub enum SessionEvent {
    /// Connected; handshakes are being exchanged
    Handshaking,
    Active { peer_id: [u8; 20] },
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    /// A request we are willing to serve (we were not choking the peer)
    Request(BlockInfo),
    Block { block: BlockInfo, data: Bytes },
    Uploaded(usize),
    Port(u16),
    /// Always the last event of a session. `None` for a requested close.
    Closed(Option<BittorrentError>),
}

#[derive(Debug)]
pub struct PeerEvent {
    pub key: PeerKey,
    pub event: SessionEvent,
}

/// One connected peer.
///
/// Owns its stream exclusively and talks to the rest of the engine only by
/// pushing `PeerEvent`s and receiving `SessionCommand`s.
pub struct PeerSession {
    key: PeerKey,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: SessionState,
    flags: PeerState,
    codec: WireCodec,
    read_buf: BytesMut,
    /// Piece responses waiting to be written
    uploads: VecDeque<(BlockInfo, Bytes)>,
    /// Requests from the peer not yet answered or cancelled
    remote_requests: HashSet<BlockInfo>,
}

impl PeerSession {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        ctx: Arc<SessionContext>,
        events: mpsc::Sender<PeerEvent>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let codec = WireCodec::new(ctx.max_message_len);
        Self {
            key,
            addr,
            ctx,
            events,
            commands,
            state: SessionState::Connecting,
            flags: PeerState::default(),
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            uploads: VecDeque::new(),
            remote_requests: HashSet::new(),
        }
    }

    /// Drive the session over an established stream until it closes.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(stream).await;
        self.close(result.err()).await;
    }

    /// Report a session whose connection could not be established.
    pub async fn abort(mut self, error: BittorrentError) {
        self.close(Some(error)).await;
    }

    async fn close(&mut self, error: Option<BittorrentError>) {
        self.transition(SessionState::Closing);
        match &error {
            Some(e) if e.is_misbehaviour() => warn!("Dropping peer {}: {}", self.addr, e),
            Some(e) => debug!("Peer {} disconnected: {}", self.addr, e),
            None => debug!("Closed session with {}", self.addr),
        }
        // The engine may already be gone during shutdown
        let _ = self
            .events
            .send(PeerEvent {
                key: self.key,
                event: SessionEvent::Closed(error),
            })
            .await;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Peer {} {:?} -> {:?}", self.addr, self.state, next);
        self.state = next;
    }

    async fn drive<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        self.transition(SessionState::HandshakePending);
        self.emit(SessionEvent::Handshaking).await?;

        let ours = Handshake::new(self.ctx.info_hash, self.ctx.local_peer_id);
        writer
            .write_all(&ours.to_bytes())
            .await
            .map_err(|e| BittorrentError::connection(self.addr, e))?;

        let addr = self.addr;
        let theirs = timeout(self.ctx.handshake_timeout, self.read_handshake(&mut reader))
            .await
            .map_err(|_| {
                BittorrentError::ConnectionError(format!("{}: handshake timed out", addr))
            })??;

        if theirs.info_hash != self.ctx.info_hash {
            return Err(BittorrentError::HandshakeMismatch(format!(
                "{} offered info-hash {}",
                self.addr,
                hex::encode(theirs.info_hash)
            )));
        }

        self.transition(SessionState::Active);
        info!(
            "Handshake complete with {} (peer id {})",
            self.addr,
            hex::encode(theirs.peer_id)
        );
        self.emit(SessionEvent::Active {
            peer_id: theirs.peer_id,
        })
        .await?;

        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();

        loop {
            while let Some(message) = self.codec.decode(&mut self.read_buf)? {
                self.handle_message(message).await?;
            }
            if self.read_buf.capacity() - self.read_buf.len() < READ_CHUNK / 4 {
                self.read_buf.reserve(READ_CHUNK);
            }

            let idle_deadline = last_received + self.ctx.idle_timeout;
            let keepalive_deadline = last_sent + self.ctx.keepalive_interval;

            tokio::select! {
                read = reader.read_buf(&mut self.read_buf) => {
                    let n = read.map_err(|e| BittorrentError::connection(addr, e))?;
                    if n == 0 {
                        return Err(BittorrentError::ConnectionError(format!(
                            "{}: connection closed by peer",
                            addr
                        )));
                    }
                    last_received = Instant::now();
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send(message)) => {
                        self.send(&mut writer, message).await?;
                        last_sent = Instant::now();
                    }
                    Some(SessionCommand::Upload { block, data }) => self.queue_upload(block, data),
                    Some(SessionCommand::Close) | None => return Ok(()),
                },
                _ = std::future::ready(()), if !self.uploads.is_empty() => {
                    if let Some((block, data)) = self.uploads.pop_front() {
                        self.remote_requests.remove(&block);
                        let len = data.len();
                        self.send(&mut writer, PeerMessage::Piece {
                            piece_index: block.piece_index,
                            offset: block.offset,
                            data,
                        })
                        .await?;
                        last_sent = Instant::now();
                        self.emit(SessionEvent::Uploaded(len)).await?;
                    }
                }
                _ = sleep_until(keepalive_deadline) => {
                    self.send(&mut writer, PeerMessage::KeepAlive).await?;
                    last_sent = Instant::now();
                }
                _ = sleep_until(idle_deadline) => {
                    return Err(BittorrentError::ConnectionError(format!(
                        "{}: no traffic for {:?}",
                        addr, self.ctx.idle_timeout
                    )));
                }
            }
        }
    }

    async fn read_handshake<R>(&mut self, reader: &mut R) -> Result<Handshake>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(handshake) = self.codec.decode_handshake(&mut self.read_buf)? {
                return Ok(handshake);
            }
            let n = reader
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| BittorrentError::connection(self.addr, e))?;
            if n == 0 {
                return Err(BittorrentError::ConnectionError(format!(
                    "{}: closed during handshake",
                    self.addr
                )));
            }
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                if !self.flags.peer_choking {
                    self.flags.peer_choking = true;
                    self.emit(SessionEvent::Choked).await?;
                }
            }
            PeerMessage::Unchoke => {
                if self.flags.peer_choking {
                    self.flags.peer_choking = false;
                    self.emit(SessionEvent::Unchoked).await?;
                }
            }
            PeerMessage::Interested => {
                if !self.flags.peer_interested {
                    self.flags.peer_interested = true;
                    self.emit(SessionEvent::Interested).await?;
                }
            }
            PeerMessage::NotInterested => {
                if self.flags.peer_interested {
                    self.flags.peer_interested = false;
                    self.emit(SessionEvent::NotInterested).await?;
                }
            }
            PeerMessage::Have { piece_index } => {
                if piece_index as usize >= self.ctx.piece_count {
                    return Err(BittorrentError::ProtocolViolation(format!(
                        "Have for piece {} of {}",
                        piece_index, self.ctx.piece_count
                    )));
                }
                self.emit(SessionEvent::Have(piece_index)).await?;
            }
            PeerMessage::Bitfield { bitfield } => {
                let bitfield = Bitfield::from_wire(&bitfield, self.ctx.piece_count)?;
                self.emit(SessionEvent::Bitfield(bitfield)).await?;
            }
            PeerMessage::Request { block } => {
                if block.length == 0 || block.length > MAX_REQUEST_LEN {
                    return Err(BittorrentError::ProtocolViolation(format!(
                        "Request for {} bytes",
                        block.length
                    )));
                }
                if self.flags.am_choking {
                    debug!("Ignoring request from choked peer {}", self.addr);
                } else if self.remote_requests.insert(block) {
                    self.emit(SessionEvent::Request(block)).await?;
                }
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo::new(piece_index, offset, data.len() as u32);
                self.emit(SessionEvent::Block { block, data }).await?;
            }
            PeerMessage::Cancel { block } => {
                self.remote_requests.remove(&block);
                self.uploads.retain(|(queued, _)| *queued != block);
            }
            PeerMessage::Port { port } => {
                self.emit(SessionEvent::Port(port)).await?;
            }
        }
        Ok(())
    }

    fn queue_upload(&mut self, block: BlockInfo, data: Bytes) {
        if self.flags.am_choking || !self.remote_requests.contains(&block) {
            debug!("Dropping stale upload of {:?} to {}", block, self.addr);
            return;
        }
        self.uploads.push_back((block, data));
    }

    async fn send<W>(&mut self, writer: &mut W, message: PeerMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match &message {
            PeerMessage::Choke => {
                self.flags.am_choking = true;
                // Choking discards everything the peer asked for
                self.uploads.clear();
                self.remote_requests.clear();
            }
            PeerMessage::Unchoke => self.flags.am_choking = false,
            PeerMessage::Interested => self.flags.am_interested = true,
            PeerMessage::NotInterested => self.flags.am_interested = false,
            _ => {}
        }

        let mut buf = BytesMut::with_capacity(message.wire_len());
        self.codec.encode(&message, &mut buf);
        writer
            .write_all(&buf)
            .await
            .map_err(|e| BittorrentError::connection(self.addr, e))?;
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(PeerEvent {
                key: self.key,
                event,
            })
            .await
            .map_err(|_| BittorrentError::ConnectionError("engine stopped".to_string()))
    }
}
