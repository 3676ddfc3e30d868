mod config;
mod driver;
mod progress;

pub use config::EngineConfig;
pub use driver::PeerStream;
pub use progress::{EngineStatus, PeerProgress, Progress};

use crate::error::{BittorrentError, Result};
use crate::torrent::TorrentMeta;
use driver::{Control, Driver};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

/// Session-to-engine event queue depth
const EVENT_CAPACITY: usize = 256;

/// Handle to one running torrent.
///
/// All state lives in a driver task; this handle only sends it commands and
/// reads the progress it publishes.
pub struct TorrentEngine {
    meta: Arc<TorrentMeta>,
    control: mpsc::UnboundedSender<Control>,
    progress: watch::Receiver<Progress>,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: Option<SocketAddr>,
}

impl TorrentEngine {
    /// Open storage (re-checking any existing data) and spawn the driver.
    /// The engine stays idle until `start` is called.
    pub async fn new(meta: TorrentMeta, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let meta = Arc::new(meta);
        let (progress_tx, progress_rx) = watch::channel(Progress::initial(&meta));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let listener = match config.listen_port {
            Some(port) => Some(
                TcpListener::bind(("0.0.0.0", port))
                    .await
                    .map_err(|e| BittorrentError::connection(format!("listen port {}", port), e))?,
            ),
            None => None,
        };
        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let driver = Driver::new(meta.clone(), config, events_tx, progress_tx).await?;
        let handle = tokio::spawn(driver.run(control_rx, events_rx, listener));

        Ok(Self {
            meta,
            control: control_tx,
            progress: progress_rx,
            driver: Mutex::new(Some(handle)),
            local_addr,
        })
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    /// Address of the inbound listener, if one is bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queue a peer address to dial. Known addresses are ignored.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<()> {
        self.send(Control::AddPeer(addr))
    }

    /// Run a session over an already established stream
    pub fn add_connection<S>(&self, addr: SocketAddr, stream: S) -> Result<()>
    where
        S: PeerStream + 'static,
    {
        self.send(Control::AddConnection(addr, Box::new(stream)))
    }

    pub fn start(&self) -> Result<()> {
        self.send(Control::Start)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Control::Pause)
    }

    /// Last published state; still answers after failure or shutdown
    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Stop every session, wait for them, and flush storage.
    /// Later calls return `Ok(())` without doing anything.
    pub async fn shutdown(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        let Some(handle) = driver.take() else {
            return Ok(());
        };
        let _ = self.control.send(Control::Shutdown);
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Engine task for {} ended abnormally: {}", self.meta.name, e);
                Err(BittorrentError::EngineStopped)
            }
        }
    }

    fn send(&self, command: Control) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| BittorrentError::EngineStopped)
    }
}
