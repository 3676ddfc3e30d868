use crate::engine::{EngineConfig, EngineStatus, Progress, TorrentEngine};
use crate::error::Result;
use crate::torrent::TorrentMeta;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bittorrent-engine")]
#[command(about = "A BitTorrent engine written in Rust", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent from the given peers
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port to accept inbound peers on
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum number of peers to connect to
        #[arg(short, long, default_value = "50")]
        max_peers: usize,

        /// Peer address to connect to (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,

        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                max_peers,
                peers,
                seed,
            } => {
                let config = EngineConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    max_peers: *max_peers,
                    ..Default::default()
                };
                self.download(torrent, config, peers, *seed).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn download(
        &self,
        torrent_path: &Path,
        config: EngineConfig,
        peers: &[SocketAddr],
        seed: bool,
    ) -> Result<()> {
        let meta = crate::torrent::load_torrent_file(torrent_path).await?;
        info!(
            "Torrent {}: {} bytes in {} pieces",
            meta.name,
            meta.total_length,
            meta.num_pieces()
        );
        if peers.is_empty() {
            warn!("No peers given; waiting for inbound connections");
        }

        let engine = TorrentEngine::new(meta, config).await?;
        if let Some(addr) = engine.local_addr() {
            info!("Accepting peers for {} on {}", engine.meta().name, addr);
        }
        for peer in peers {
            engine.add_peer(*peer)?;
        }
        engine.start()?;

        let mut updates = engine.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);
        loop {
            tokio::select! {
                _ = &mut interrupted => {
                    info!("Interrupted, shutting down");
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let progress = updates.borrow_and_update().clone();
                    let finished = matches!(progress.status, EngineStatus::Failed(_) | EngineStatus::Stopped)
                        || (progress.is_complete() && !seed);
                    if finished {
                        print_progress(&progress);
                        break;
                    }
                }
                _ = ticker.tick() => print_progress(&engine.progress()),
            }
        }

        engine.shutdown().await
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let meta = crate::torrent::load_torrent_file(torrent_path).await?;
        print_info(&meta);
        Ok(())
    }
}

fn print_progress(progress: &Progress) {
    let down: f64 = progress.peers.iter().map(|p| p.download_rate).sum();
    let up: f64 = progress.peers.iter().map(|p| p.upload_rate).sum();
    println!(
        "{:?}: {:.1}% ({}/{} pieces), {} peers, down {:.1} KiB/s, up {:.1} KiB/s",
        progress.status,
        progress.percent(),
        progress.pieces_completed,
        progress.pieces_total,
        progress.peers.len(),
        down / 1024.0,
        up / 1024.0
    );
}

fn print_info(meta: &TorrentMeta) {
    println!("Torrent Information");
    println!("==================");
    println!("Name: {}", meta.name);
    if let Some(announce) = &meta.announce {
        println!("Tracker: {}", announce);
    }
    println!("Total Size: {} bytes", meta.total_length);
    println!("Piece Length: {} bytes", meta.piece_length);
    println!("Number of Pieces: {}", meta.num_pieces());
    println!("Info Hash: {}", meta.info_hash_hex());
    if let Some(comment) = &meta.comment {
        println!("Comment: {}", comment);
    }
    if let Some(created_by) = &meta.created_by {
        println!("Created By: {}", created_by);
    }
    if let Some(date) = meta.creation_date {
        println!("Creation Date: {} (unix time)", date);
    }
    println!("Magnet: {}", meta.magnet_link());
    println!("\nFiles:");

    for (i, file) in meta.files.iter().enumerate() {
        println!("  {}: {} ({} bytes)", i + 1, file.path.join("/"), file.length);
    }

    if !meta.announce_list.is_empty() {
        println!("\nAdditional Trackers:");
        for (tier, trackers) in meta.announce_list.iter().enumerate() {
            println!("  Tier {}:", tier + 1);
            for tracker in trackers {
                println!("    - {}", tracker);
            }
        }
    }
}
