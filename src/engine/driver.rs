use super::config::EngineConfig;
use super::progress::{EngineStatus, PeerProgress, Progress};
use crate::choke::{ChokeCandidate, ChokeDecision, ChokeManager};
use crate::error::{BittorrentError, Result};
use crate::peer::{
    generate_peer_id, BlockInfo, PeerEvent, PeerKey, PeerMessage, PeerSession, PeerState,
    RateEstimator, SessionCommand, SessionContext, SessionEvent, SessionState,
};
use crate::piece::{BitfieldTracker, Delivery, PieceSelector};
use crate::storage::{PieceStore, Verification};
use crate::torrent::TorrentMeta;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for sessions before aborting them
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A byte stream a session can run over
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub(super) enum Control {
    AddPeer(SocketAddr),
    AddConnection(SocketAddr, Box<dyn PeerStream>),
    Start,
    Pause,
    Shutdown,
}

/// Engine-side view of one session
struct PeerEntry {
    addr: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: SessionState,
    peer_id: Option<[u8; 20]>,
    flags: PeerState,
    download: RateEstimator,
    upload: RateEstimator,
    outbound: bool,
}

impl PeerEntry {
    fn send(&self, message: PeerMessage) {
        // A closed session reports Closed on its own
        let _ = self.commands.send(SessionCommand::Send(message));
    }
}

/// The single task that owns all shared torrent state.
///
/// Sessions report through `PeerEvent`s and are steered with
/// `SessionCommand`s; nothing else touches the tracker, selector or store.
pub(super) struct Driver {
    meta: Arc<TorrentMeta>,
    config: EngineConfig,
    ctx: Arc<SessionContext>,
    store: PieceStore,
    tracker: BitfieldTracker,
    selector: PieceSelector,
    choker: ChokeManager,
    rng: StdRng,
    peers: HashMap<PeerKey, PeerEntry>,
    next_key: u64,
    /// Addresses connected or waiting to be dialled
    known: HashSet<SocketAddr>,
    candidates: VecDeque<SocketAddr>,
    /// Peers that misbehaved, dialled only when nothing else is waiting
    deprioritized: VecDeque<SocketAddr>,
    events_tx: mpsc::Sender<PeerEvent>,
    tasks: JoinSet<()>,
    progress: watch::Sender<Progress>,
    started: bool,
    paused: bool,
    stopped: bool,
    failure: Option<String>,
    downloaded: u64,
    uploaded: u64,
    /// Something a progress reader would notice changed since the last publish
    dirty: bool,
}

impl Driver {
    pub(super) async fn new(
        meta: Arc<TorrentMeta>,
        config: EngineConfig,
        events_tx: mpsc::Sender<PeerEvent>,
        progress: watch::Sender<Progress>,
    ) -> Result<Self> {
        let piece_count = meta.num_pieces();
        let store = PieceStore::open(&config.download_dir, meta.clone())
            .await?
            .with_buffer_limit(config.max_buffered_bytes);
        let mut tracker = BitfieldTracker::new(piece_count);
        let mut selector = PieceSelector::new(&meta, config.selection_policy());

        if store.had_existing_data() {
            for index in store.scan_complete().await? {
                selector.mark_complete(index as usize);
                tracker.mark_local(index as usize);
            }
        }

        let local_peer_id = generate_peer_id();
        info!(
            "Engine for {} (info hash {}) with peer id {}",
            meta.name,
            meta.info_hash_hex(),
            hex::encode(local_peer_id)
        );

        let ctx = Arc::new(SessionContext {
            info_hash: meta.info_hash,
            local_peer_id,
            piece_count,
            max_message_len: config.message_limit(piece_count),
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            idle_timeout: config.idle_timeout,
        });
        let choker = ChokeManager::new(config.unchoke_slots, config.optimistic_unchoke_every);

        let mut driver = Self {
            meta,
            config,
            ctx,
            store,
            tracker,
            selector,
            choker,
            rng: StdRng::from_entropy(),
            peers: HashMap::new(),
            next_key: 0,
            known: HashSet::new(),
            candidates: VecDeque::new(),
            deprioritized: VecDeque::new(),
            events_tx,
            tasks: JoinSet::new(),
            progress,
            started: false,
            paused: false,
            stopped: false,
            failure: None,
            downloaded: 0,
            uploaded: 0,
            dirty: false,
        };
        driver.publish();
        Ok(driver)
    }

    pub(super) async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::Receiver<PeerEvent>,
        listener: Option<TcpListener>,
    ) -> Result<()> {
        let mut choke_timer = interval_at(
            tokio::time::Instant::now() + self.config.choke_interval,
            self.config.choke_interval,
        );
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            let step = tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Shutdown) | None => break Ok(()),
                    Some(command) => self.handle_control(command),
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = choke_timer.tick() => {
                    self.run_choke_cycle();
                    Ok(())
                }
                _ = tick.tick() => {
                    self.housekeeping();
                    self.dirty = true;
                    Ok(())
                }
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_inbound(addr, Box::new(stream)),
                        Err(e) => warn!("Failed to accept peer: {}", e),
                    }
                    Ok(())
                }
            };

            if let Err(e) = step {
                break Err(e);
            }
            if self.dirty {
                self.publish();
            }
        };

        if let Err(e) = &result {
            error!("Engine for {} failed: {}", self.meta.name, e);
            self.failure = Some(e.to_string());
        }
        drop(listener);
        let flushed = self.teardown(events).await;
        self.stopped = true;
        if let (Ok(()), Err(e)) = (&result, &flushed) {
            self.failure = Some(e.to_string());
        }
        self.publish();
        result.and(flushed)
    }

    /// Close every session, wait for them and flush the store
    async fn teardown(&mut self, events: mpsc::Receiver<PeerEvent>) -> Result<()> {
        for entry in self.peers.values() {
            let _ = entry.commands.send(SessionCommand::Close);
        }
        // Sessions blocked on reporting now fail fast
        drop(events);

        let tasks = &mut self.tasks;
        let drained = timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Sessions did not close in time, aborting them");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.peers.clear();
        self.store.flush().await?;
        info!("Engine for {} stopped", self.meta.name);
        Ok(())
    }

    fn handle_control(&mut self, command: Control) -> Result<()> {
        self.dirty = true;
        match command {
            Control::AddPeer(addr) => {
                if self.known.insert(addr) {
                    debug!("Queued peer {}", addr);
                    self.candidates.push_back(addr);
                    self.dial_pending();
                } else {
                    debug!("Peer {} already known", addr);
                }
            }
            Control::AddConnection(addr, stream) => {
                self.known.insert(addr);
                self.spawn_session(addr, Some(stream), true);
            }
            Control::Start => {
                if !self.started || self.paused {
                    info!("Starting {}", self.meta.name);
                    self.started = true;
                    self.paused = false;
                    for key in self.active_keys() {
                        self.update_interest(key);
                    }
                    self.run_choke_cycle();
                    self.dial_pending();
                }
            }
            Control::Pause => {
                if self.started && !self.paused {
                    info!("Pausing {}", self.meta.name);
                    self.paused = true;
                    self.quiesce();
                }
            }
            Control::Shutdown => {}
        }
        Ok(())
    }

    /// Cancel all requests and stop trading with every peer
    fn quiesce(&mut self) {
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let released = self.selector.release_peer(key);
            let Some(entry) = self.peers.get_mut(&key) else {
                continue;
            };
            for block in released {
                entry.send(PeerMessage::Cancel { block });
            }
            if entry.state != SessionState::Active {
                continue;
            }
            if !entry.flags.am_choking {
                entry.flags.am_choking = true;
                entry.send(PeerMessage::Choke);
            }
            if entry.flags.am_interested {
                entry.flags.am_interested = false;
                entry.send(PeerMessage::NotInterested);
            }
        }
    }

    async fn handle_event(&mut self, PeerEvent { key, event }: PeerEvent) -> Result<()> {
        if let SessionEvent::Closed(reason) = event {
            self.remove_peer(key, reason);
            self.dirty = true;
            return Ok(());
        }
        let Some(entry) = self.peers.get_mut(&key) else {
            return Ok(());
        };

        match event {
            SessionEvent::Handshaking => {
                entry.state = SessionState::HandshakePending;
                self.dirty = true;
            }
            SessionEvent::Active { peer_id } => {
                entry.state = SessionState::Active;
                entry.peer_id = Some(peer_id);
                self.dirty = true;
                self.tracker.add_peer(key);
                if !self.tracker.local().is_empty() {
                    entry.send(PeerMessage::Bitfield {
                        bitfield: Bytes::copy_from_slice(self.tracker.local().as_bytes()),
                    });
                }
            }
            SessionEvent::Choked => {
                entry.flags.peer_choking = true;
                let released = self.selector.release_peer(key);
                if !released.is_empty() {
                    debug!("Peer {} choked us with {} requests out", entry.addr, released.len());
                    self.schedule_all();
                }
            }
            SessionEvent::Unchoked => {
                entry.flags.peer_choking = false;
                self.schedule(key);
            }
            SessionEvent::Interested => entry.flags.peer_interested = true,
            SessionEvent::NotInterested => entry.flags.peer_interested = false,
            SessionEvent::Have(index) => {
                if self.tracker.record_have(key, index as usize) {
                    self.update_interest(key);
                }
            }
            SessionEvent::Bitfield(bitfield) => {
                self.tracker.set_bitfield(key, bitfield);
                self.update_interest(key);
            }
            SessionEvent::Request(block) => self.serve(key, block).await?,
            SessionEvent::Block { block, data } => {
                entry.download.record(data.len() as u64);
                self.downloaded += data.len() as u64;
                self.receive(key, block, data).await?;
                self.schedule(key);
            }
            SessionEvent::Uploaded(n) => {
                entry.upload.record(n as u64);
                self.uploaded += n as u64;
            }
            SessionEvent::Port(port) => debug!("Peer {} has DHT port {}", entry.addr, port),
            SessionEvent::Closed(_) => {}
        }
        Ok(())
    }

    async fn serve(&mut self, key: PeerKey, block: BlockInfo) -> Result<()> {
        let allowed = self
            .peers
            .get(&key)
            .is_some_and(|entry| !entry.flags.am_choking);
        if !allowed || self.paused || !self.tracker.local_has(block.piece_index as usize) {
            debug!("Not serving {:?} to peer {}", block, key);
            return Ok(());
        }

        match self
            .store
            .read_block(block.piece_index, block.offset, block.length)
            .await
        {
            Ok(data) => {
                if let Some(entry) = self.peers.get(&key) {
                    let _ = entry.commands.send(SessionCommand::Upload { block, data });
                }
                Ok(())
            }
            Err(e) if e.is_peer_local() => {
                warn!("Closing peer {}: {}", key, e);
                self.close_peer(key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn receive(&mut self, key: PeerKey, block: BlockInfo, data: Bytes) -> Result<()> {
        if !self.store.can_buffer(block.piece_index) {
            debug!("Write buffer full, dropping {:?} from peer {}", block, key);
            self.selector.release_block(key, &block);
            return Ok(());
        }
        match self.selector.block_received(key, block) {
            Delivery::Invalid => {
                debug!("Discarding malformed block {:?} from peer {}", block, key);
            }
            Delivery::Duplicate => {
                debug!("Discarding duplicate block {:?} from peer {}", block, key);
            }
            Delivery::Unsolicited => {
                debug!("Discarding unrequested block {:?} from peer {}", block, key);
            }
            Delivery::Accepted {
                cancels,
                piece_assembled,
            } => {
                for (other, block) in cancels {
                    if let Some(entry) = self.peers.get(&other) {
                        entry.send(PeerMessage::Cancel { block });
                    }
                }
                self.store
                    .write_block(block.piece_index, block.offset, &data, key)?;
                if piece_assembled {
                    self.verify(block.piece_index).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify(&mut self, index: u32) -> Result<()> {
        self.dirty = true;
        match self.store.verify_piece(index).await? {
            Verification::Verified => {
                self.selector.piece_verified(index as usize);
                self.tracker.mark_local(index as usize);
                info!(
                    "Piece {} complete ({}/{})",
                    index,
                    self.selector.complete_count(),
                    self.selector.piece_count()
                );

                for entry in self.peers.values() {
                    if entry.state == SessionState::Active {
                        entry.send(PeerMessage::Have { piece_index: index });
                    }
                }
                for key in self.active_keys() {
                    self.update_interest(key);
                }
                if self.selector.is_complete() {
                    info!("Download of {} complete, seeding", self.meta.name);
                }
            }
            Verification::Corrupt { contributors } => {
                self.selector.piece_failed(index as usize, &contributors);
                self.schedule_all();
            }
        }
        Ok(())
    }

    fn remove_peer(&mut self, key: PeerKey, reason: Option<BittorrentError>) {
        let Some(entry) = self.peers.remove(&key) else {
            return;
        };
        self.tracker.remove_peer(key);
        self.choker.remove_peer(key);
        self.known.remove(&entry.addr);

        if let Some(e) = &reason {
            if e.is_misbehaviour() && entry.outbound {
                self.known.insert(entry.addr);
                self.deprioritized.push_back(entry.addr);
            }
        }

        let released = self.selector.remove_peer(key);
        debug!(
            "Removed peer {} ({}), released {} requests",
            entry.addr,
            key,
            released.len()
        );
        if !released.is_empty() {
            self.schedule_all();
        }
        self.dial_pending();
    }

    fn close_peer(&mut self, key: PeerKey) {
        if let Some(entry) = self.peers.get(&key) {
            let _ = entry.commands.send(SessionCommand::Close);
        }
    }

    /// Send Interested/NotInterested as needed, then fill the pipeline
    fn update_interest(&mut self, key: PeerKey) {
        let wanted = self.started
            && !self.paused
            && !self.selector.is_complete()
            && self.tracker.is_interesting(key);
        let Some(entry) = self.peers.get_mut(&key) else {
            return;
        };
        if entry.state != SessionState::Active {
            return;
        }
        if entry.flags.am_interested != wanted {
            entry.flags.am_interested = wanted;
            entry.send(if wanted {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            });
        }
        if wanted {
            self.schedule(key);
        }
    }

    fn schedule(&mut self, key: PeerKey) {
        if !self.started || self.paused {
            return;
        }
        let ready = self.peers.get(&key).is_some_and(|entry| {
            entry.state == SessionState::Active
                && entry.flags.am_interested
                && !entry.flags.peer_choking
        });
        if !ready {
            return;
        }

        let blocks = self.selector.next_requests(key, &self.tracker, Instant::now());
        if let Some(entry) = self.peers.get(&key) {
            for block in blocks {
                entry.send(PeerMessage::Request { block });
            }
        }
    }

    fn schedule_all(&mut self) {
        for key in self.active_keys() {
            self.schedule(key);
        }
    }

    fn active_keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Active)
            .map(|(key, _)| *key)
            .collect();
        keys.sort_unstable();
        keys
    }

    fn run_choke_cycle(&mut self) {
        if !self.started || self.paused {
            return;
        }
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Active)
            .map(|(key, entry)| ChokeCandidate {
                key: *key,
                download_rate: entry.download.rate(),
                upload_rate: entry.upload.rate(),
                interested: entry.flags.peer_interested,
                am_choking: entry.flags.am_choking,
            })
            .collect();

        let seeding = self.selector.is_complete();
        for decision in self.choker.run_cycle(&candidates, seeding, &mut self.rng) {
            let (key, choke) = match decision {
                ChokeDecision::Choke(key) => (key, true),
                ChokeDecision::Unchoke(key) => (key, false),
            };
            if let Some(entry) = self.peers.get_mut(&key) {
                entry.flags.am_choking = choke;
                entry.send(if choke {
                    PeerMessage::Choke
                } else {
                    PeerMessage::Unchoke
                });
            }
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        for entry in self.peers.values_mut() {
            entry.download.update(now);
            entry.upload.update(now);
        }
        if !self.started || self.paused {
            return;
        }

        let expired = self.selector.expire(now, self.config.request_timeout);
        for (key, block) in &expired {
            if let Some(entry) = self.peers.get(key) {
                debug!("Request {:?} to {} timed out", block, entry.addr);
                entry.send(PeerMessage::Cancel { block: *block });
            }
        }
        if !expired.is_empty() {
            self.schedule_all();
        }
        self.dial_pending();
    }

    fn dial_pending(&mut self) {
        if !self.started || self.paused {
            return;
        }
        while self.peers.len() < self.config.max_peers {
            let Some(addr) = self
                .candidates
                .pop_front()
                .or_else(|| self.deprioritized.pop_front())
            else {
                break;
            };
            self.spawn_session(addr, None, true);
        }
    }

    fn accept_inbound(&mut self, addr: SocketAddr, stream: Box<dyn PeerStream>) {
        if self.peers.len() >= self.config.max_peers || self.known.contains(&addr) {
            debug!("Rejecting inbound peer {}", addr);
            return;
        }
        self.known.insert(addr);
        self.spawn_session(addr, Some(stream), false);
    }

    /// Start a session, dialling `addr` when no stream is supplied
    fn spawn_session(&mut self, addr: SocketAddr, stream: Option<Box<dyn PeerStream>>, outbound: bool) {
        let key = PeerKey(self.next_key);
        self.next_key += 1;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(key, addr, self.ctx.clone(), self.events_tx.clone(), commands_rx);
        let connect_timeout = self.config.connect_timeout;

        match stream {
            Some(stream) => {
                self.tasks.spawn(session.run(stream));
            }
            None => {
                self.tasks.spawn(async move {
                    match timeout(connect_timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => session.run(stream).await,
                        Ok(Err(e)) => session.abort(BittorrentError::connection(addr, e)).await,
                        Err(_) => {
                            session
                                .abort(BittorrentError::ConnectionError(format!(
                                    "{}: connect timed out",
                                    addr
                                )))
                                .await
                        }
                    }
                });
            }
        }

        debug!("Opened session {} with {}", key, addr);
        let now = Instant::now();
        self.peers.insert(
            key,
            PeerEntry {
                addr,
                commands: commands_tx,
                state: SessionState::Connecting,
                peer_id: None,
                flags: PeerState::default(),
                download: RateEstimator::new(self.config.rate_window, now),
                upload: RateEstimator::new(self.config.rate_window, now),
                outbound,
            },
        );
    }

    fn status(&self) -> EngineStatus {
        if let Some(failure) = &self.failure {
            return EngineStatus::Failed(failure.clone());
        }
        if self.stopped {
            return EngineStatus::Stopped;
        }
        if !self.started {
            return EngineStatus::Idle;
        }
        if self.paused {
            return EngineStatus::Paused;
        }
        if self.selector.is_complete() {
            return EngineStatus::Seeding;
        }
        let useful = self.peers.iter().any(|(key, entry)| {
            entry.state != SessionState::Active || self.tracker.is_interesting(*key)
        });
        if useful || !self.candidates.is_empty() {
            EngineStatus::Downloading
        } else {
            EngineStatus::Stalled
        }
    }

    fn publish(&mut self) {
        self.dirty = false;
        let local = self.tracker.local();
        let bytes_completed = local
            .iter_set()
            .map(|index| self.meta.piece_len(index as u32) as u64)
            .sum();

        let mut peers: Vec<PeerProgress> = self
            .peers
            .iter()
            .map(|(key, entry)| PeerProgress {
                addr: entry.addr,
                peer_id: entry.peer_id.map(hex::encode),
                state: entry.state,
                completion: self.tracker.peer_completion(*key),
                download_rate: entry.download.rate(),
                upload_rate: entry.upload.rate(),
                downloaded: entry.download.total(),
                uploaded: entry.upload.total(),
                flags: entry.flags,
                outstanding: self.selector.outstanding(*key),
            })
            .collect();
        peers.sort_by_key(|p| p.addr);

        self.progress.send_replace(Progress {
            status: self.status(),
            bytes_completed,
            bytes_total: self.meta.total_length,
            pieces_completed: local.count(),
            pieces_total: self.meta.num_pieces(),
            bitfield: local.clone(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            peers,
        });
    }
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
