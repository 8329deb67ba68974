use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use peerclip::connection::events::{ALL_EVENT_KINDS, logging_handler};
use peerclip::connection::{EventKind, PeerConnectionManager, PeerEvent, PeerOptions};
use peerclip::core::{PeerId, Role, SourceFile, TransferStatus};
use peerclip::crypto;
use peerclip::infrastructure::{DirectoryFileSink, InMemorySwarm, LoopbackNetwork, SwarmHub, relay_signals};
use peerclip::orchestrator::{TransferEvent, TransferOrchestrator, select_method};
use peerclip::utils;
use peerclip::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer files between two in-process peers over the loopback transport
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory the receiving peer saves into
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,
    },
    /// Show how a file would be chunked and which transfer method it gets
    Plan {
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

// Returns a WorkerGuard that must be kept alive for logs to be written
fn init_logging(log_file_prefix: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking_appender).with_ansi(false);
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn read_source(path: &Path) -> Result<SourceFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = utils::get_filename(path).ok_or_else(|| anyhow!("not a file path: {}", path.display()))?;
    Ok(SourceFile::new(name, utils::guess_mime_type(path), bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    // This guard needs to stay in scope, otherwise logs stop writing.
    let _guard = init_logging("peerclip")?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Send { files, out } => send(config, files, out).await?,
        Commands::Plan { file } => plan(&config, &file).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn plan(config: &AppConfig, path: &Path) -> Result<()> {
    let size = tokio::fs::metadata(path).await?.len();
    let chunk_size = config.chunker.chunk_size;
    let hash = crypto::compute_file_hash(path).await?;
    println!("File:    {}", path.display());
    println!("Size:    {} ({} bytes)", utils::format_size(size), size);
    println!("SHA-256: {}", hash);
    println!("Method:  {}", select_method(size, config.orchestrator.swarm_threshold));
    println!(
        "Chunks:  {} x {}",
        utils::calculate_chunks(size, chunk_size),
        utils::format_size(chunk_size as u64)
    );
    Ok(())
}

async fn send(config: AppConfig, paths: Vec<PathBuf>, out: PathBuf) -> Result<()> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in &paths {
        sources.push(read_source(path).await?);
    }
    let total_bytes: u64 = sources.iter().map(SourceFile::size).sum();

    let alice_id = PeerId::new(format!("sender-{}", utils::random_id(6)));
    let bob_id = PeerId::new(format!("receiver-{}", utils::random_id(6)));
    let network = LoopbackNetwork::new();
    let hub = SwarmHub::new();

    let alice = PeerConnectionManager::new(config.connection.clone(), network.factory(alice_id.clone()));
    let bob = PeerConnectionManager::new(config.connection.clone(), network.factory(bob_id.clone()));
    relay_signals(&alice, &alice_id, &bob);
    relay_signals(&bob, &bob_id, &alice);
    for kind in ALL_EVENT_KINDS {
        alice.on(kind, logging_handler());
        bob.on(kind, logging_handler());
    }

    let sender = TransferOrchestrator::with_swarm(
        alice_id.clone(),
        config.clone(),
        Arc::new(alice.clone()),
        Arc::new(DirectoryFileSink::new(&out)),
        Arc::new(InMemorySwarm::new(hub.clone())),
    );
    let mut receiver_config = config;
    receiver_config.orchestrator.auto_accept = true;
    let receiver = TransferOrchestrator::with_swarm(
        bob_id.clone(),
        receiver_config,
        Arc::new(bob.clone()),
        Arc::new(DirectoryFileSink::new(&out)),
        Arc::new(InMemorySwarm::new(hub)),
    );
    sender.attach(&alice);
    receiver.attach(&bob);

    let connected = Arc::new(Notify::new());
    let notify = connected.clone();
    alice.on_peer(
        &bob_id,
        EventKind::Connect,
        Arc::new(move |_: &PeerEvent| {
            notify.notify_one();
            Ok(())
        }),
    );
    alice.create_peer(&bob_id, Role::Initiator, PeerOptions::default())?;
    tokio::time::timeout(CONNECT_TIMEOUT, connected.notified())
        .await
        .context("peers did not connect")?;
    info!(sender = %alice_id, receiver = %bob_id, "Loopback peers connected");

    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?,
    );
    let progress_bar = pb.clone();
    let per_file = Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
    sender.on_event(Arc::new(move |event: &TransferEvent| {
        if let TransferEvent::Progress(state) = event {
            let mut per_file = per_file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            per_file.insert(state.transfer_id.clone(), state.bytes_transferred);
            progress_bar.set_position(per_file.values().sum());
        }
        Ok(())
    }));

    let expected = sources.len();
    let received = Arc::new(AtomicUsize::new(0));
    let all_received = Arc::new(Notify::new());
    {
        let received = received.clone();
        let all_received = all_received.clone();
        receiver.on_event(Arc::new(move |event: &TransferEvent| {
            match event {
                TransferEvent::FileReceived { file_name, size, verification_passed, .. } => {
                    info!(file = %file_name, bytes = size, ?verification_passed, "Receiver saved file");
                    if received.fetch_add(1, Ordering::SeqCst) + 1 == expected {
                        all_received.notify_one();
                    }
                }
                TransferEvent::StatusChanged { status: TransferStatus::Failed { reason }, transfer_id } => {
                    error!(%transfer_id, "Receive failed: {}", reason);
                }
                _ => {}
            }
            Ok(())
        }));
    }

    let names: Vec<String> = sources.iter().map(|file| file.name.clone()).collect();
    let results = sender.send_files(&bob_id, sources).await;
    pb.finish();

    let mut failures = 0;
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(TransferStatus::Completed) => println!("{}: sent", name),
            Ok(status) => {
                failures += 1;
                println!("{}: {:?}", name, status);
            }
            Err(e) => {
                failures += 1;
                println!("{}: {}", name, e);
            }
        }
    }
    if failures == 0 && tokio::time::timeout(CONNECT_TIMEOUT, all_received.notified()).await.is_ok() {
        println!("Saved {} file(s) to {}", expected, out.display());
    }

    sender.destroy();
    receiver.destroy();
    alice.destroy();
    bob.destroy();

    if failures > 0 {
        bail!("{} of {} transfers failed", failures, expected);
    }
    Ok(())
}
