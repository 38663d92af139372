use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::oneshot;
use tracing::{info, warn};

use mirrorsync::config::Config;
use mirrorsync::crypto::CryptoManager;
use mirrorsync::fs::OpendalTransport;
use mirrorsync::sync::{
    ChangeKind, ChangeWatcher, Destination, IgnoreMatcher, SyncEngine, SyncOptions, SyncReport,
    IGNORE_FILE_NAME,
};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(author, version, about = "One-way directory mirroring with change watching", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a directory tree once
    Sync {
        source: PathBuf,
        /// Local directory, or a root on the configured remote with --remote
        dest: String,
        /// Encrypt files with the configured key
        #[arg(long)]
        encrypt: bool,
        /// Write to the remote transport from the config file
        #[arg(long)]
        remote: bool,
        /// Concurrent file transfers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Print debounced changes, re-syncing after each batch when a destination is given
    Watch {
        source: PathBuf,
        dest: Option<String>,
        #[arg(long)]
        debounce: Option<u64>,
        #[arg(long)]
        no_recursive: bool,
        #[arg(long)]
        remote: bool,
    },
    /// Decrypt one file produced by an encrypted sync
    Decrypt { source: PathBuf, dest: PathBuf },
    /// Write a fresh encryption key
    Keygen { path: PathBuf },
    /// Write the default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Keygen { path } => {
            CryptoManager::generate_key_file(&path)
                .with_context(|| format!("Failed to write key to {}", path.display()))?;
            println!("{} key written to {}", "✓".green(), path.display());
            Ok(())
        }
        Commands::InitConfig => {
            let path = config_path(cli.config.as_deref())?;
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            Config::default().save(&path)?;
            println!("{} wrote {}", "✓".green(), path.display());
            Ok(())
        }
        Commands::Decrypt { source, dest } => {
            let config = load_config(cli.config.as_deref())?;
            let crypto = load_crypto(&config)?;
            crypto
                .decrypt_file(&source, &dest)
                .with_context(|| format!("Failed to decrypt {}", source.display()))?;
            println!("{} {} -> {}", "✓".green(), source.display(), dest.display());
            Ok(())
        }
        Commands::Sync {
            source,
            dest,
            encrypt,
            remote,
            workers,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(workers) = workers {
                config.sync.workers = workers.clamp(1, num_cpus::get().max(1));
            }
            if encrypt {
                config.encryption.enabled = true;
            }
            let engine = Arc::new(build_engine(&config, &source)?);
            let destination = build_destination(&config, &dest, remote)?;
            cancel_on_ctrl_c(&engine);

            let report = run_with_progress(&engine, &source, &destination).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Watch {
            source,
            dest,
            debounce,
            no_recursive,
            remote,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(ms) = debounce {
                config.watch.debounce_ms = ms;
            }
            if no_recursive {
                config.watch.recursive = false;
            }
            let target = match dest {
                Some(dest) => Some((
                    Arc::new(build_engine(&config, &source)?),
                    build_destination(&config, &dest, remote)?,
                )),
                None => None,
            };
            watch(&config, &source, target).await
        }
    }
}

fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::default_path().context("Could not determine config directory"),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = config_path(explicit)?;
    let config = Config::load_or_default(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn load_crypto(config: &Config) -> Result<CryptoManager> {
    let key_file = config
        .encryption
        .key_file
        .as_deref()
        .context("encryption.key_file is not set")?;
    Ok(CryptoManager::from_key_file(key_file)?)
}

fn build_engine(config: &Config, source: &Path) -> Result<SyncEngine> {
    let mut options = SyncOptions::from_config(config)?;

    let ignore_file = source.join(IGNORE_FILE_NAME);
    if ignore_file.is_file() {
        let content = std::fs::read_to_string(&ignore_file)
            .with_context(|| format!("Failed to read {}", ignore_file.display()))?;
        options.ignore.merge(&IgnoreMatcher::parse_ignore_file(&content));
    }

    let mut engine = SyncEngine::new(options);
    if config.encryption.enabled {
        engine = engine.with_crypto(Arc::new(load_crypto(config)?));
    }
    Ok(engine)
}

fn build_destination(config: &Config, dest: &str, remote: bool) -> Result<Destination> {
    if !remote {
        return Ok(Destination::Local(PathBuf::from(dest)));
    }
    let remote = config
        .remote
        .as_ref()
        .context("--remote needs a [remote] section in the config")?;
    let transport = OpendalTransport::from_config(remote)?;
    Ok(Destination::remote(Arc::new(transport), dest))
}

fn cancel_on_ctrl_c(engine: &SyncEngine) {
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current entry");
            cancel.cancel();
        }
    });
}

async fn run_with_progress(
    engine: &SyncEngine,
    source: &Path,
    dest: &Destination,
) -> Result<SyncReport> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    let mut progress = engine.subscribe_progress();
    let bar = pb.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = &mut done_rx => break,
                _ = interval.tick() => {
                    if let Some(tracker) = progress.borrow_and_update().as_ref() {
                        bar.set_length(tracker.total());
                        bar.set_position(tracker.completed());
                        bar.set_message(tracker.to_string());
                    }
                }
            }
        }
    });

    let result = engine.sync_directory(source, dest).await;
    let _ = done_tx.send(());
    let _ = ticker.await;

    match result {
        Ok(report) => {
            pb.finish_and_clear();
            Ok(report)
        }
        Err(e) => {
            pb.abandon();
            Err(e).with_context(|| format!("Sync of {} to {} failed", source.display(), dest))
        }
    }
}

fn print_report(report: &SyncReport) {
    let stats = &report.stats;
    println!(
        "{} {} copied, {} patched, {} unchanged, {} dirs, {} symlinks ({} skipped), {} special skipped",
        "✓".green(),
        stats.files_copied,
        stats.files_patched,
        stats.files_unchanged,
        stats.dirs_created,
        stats.symlinks_created,
        stats.symlinks_skipped,
        stats.special_skipped,
    );
    println!(
        "  {} written of {} in {:.2}s",
        format_size(stats.bytes_transferred, BINARY).bold(),
        format_size(report.total_bytes, BINARY),
        report.duration.as_secs_f64()
    );
}

async fn watch(
    config: &Config,
    source: &Path,
    target: Option<(Arc<SyncEngine>, Destination)>,
) -> Result<()> {
    if let Some((engine, dest)) = &target {
        let report = run_with_progress(engine, source, dest).await?;
        print_report(&report);
    }

    let mut watcher = ChangeWatcher::new(config.watch.debounce());
    let mut events = watcher.take_events().context("Watcher events already taken")?;
    let mut errors = watcher.take_errors().context("Watcher errors already taken")?;
    watcher
        .watch(source, config.watch.recursive)
        .with_context(|| format!("Failed to watch {}", source.display()))?;
    info!(path = %source.display(), debounce_ms = config.watch.debounce_ms, "watching for changes");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(err) = errors.recv() => warn!(error = %err, "watch error"),
            event = events.recv() => {
                let Some(event) = event else { break };
                let mut batch = vec![event];
                while let Ok(more) = events.try_recv() {
                    batch.push(more);
                }
                for event in &batch {
                    let label = match event.kind {
                        ChangeKind::Created => "created".green(),
                        ChangeKind::Modified => "modified".yellow(),
                        ChangeKind::Removed => "removed".red(),
                        ChangeKind::Renamed => "renamed".cyan(),
                    };
                    println!(
                        "{} {:>8} {}",
                        event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                        label,
                        event.path.display()
                    );
                }
                if let Some((engine, dest)) = &target {
                    match run_with_progress(engine, source, dest).await {
                        Ok(report) => print_report(&report),
                        Err(e) => eprintln!("{} {:#}", "✗".red(), e),
                    }
                }
            }
        }
    }

    watcher.close();
    Ok(())
}
