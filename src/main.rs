use anyhow::{bail, Context, Result};
use bottle_sync::hash_file::{validate_external_hash_file, HashFileStats};
use bottle_sync::logging::{self, LogFormat};
use bottle_sync::*;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bottle-sync")]
#[command(about = "Maintain the ledger of Homebrew bottles mirrored to object storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Root directory of the object store
    #[arg(long, global = true, env = "BOTTLE_SYNC_STORE_DIR", default_value = "./bottle-store")]
    store_dir: PathBuf,

    /// Bucket name (overrides s3_bucket_name from the configuration)
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log format (pretty, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the ledger through the full fallback ladder and report on it
    Status,

    /// Check the canonical hash file for corruption without repairing it
    Verify,

    /// Back up the canonical hash file and rebuild it from the bottle objects
    Rebuild {
        /// Rebuild even if the current hash file looks healthy
        #[arg(long)]
        force: bool,
    },

    /// Validate an external hash file
    Validate {
        /// Path to the JSON document
        file: PathBuf,
    },

    /// Merge an external hash file into the ledger and save it
    Merge {
        /// Path to the JSON document
        file: PathBuf,

        /// Report what would be merged without saving
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy the canonical hash file to a timestamped backup
    Backup,

    /// Show whether an interrupted sync can be resumed
    ResumeStatus {
        /// Sync run identifier
        sync_id: String,
    },

    /// Delete the persisted sync checkpoint
    ClearRecovery,
}

const DEFAULT_BUCKET: &str = "homebrew-bottles";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    logging::init(cli.log_format, level);

    setup_signal_handlers()?;

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let storage = open_storage(&cli, &config)?;

    match &cli.command {
        Commands::Status => status(storage, &config),
        Commands::Verify => verify(storage),
        Commands::Rebuild { force } => rebuild(storage, *force),
        Commands::Validate { file } => validate(file),
        Commands::Merge { file, dry_run } => merge(storage, &config, file, *dry_run),
        Commands::Backup => backup(storage),
        Commands::ResumeStatus { sync_id } => resume_status(storage, sync_id),
        Commands::ClearRecovery => clear_recovery(storage),
    }
}

fn open_storage(cli: &Cli, config: &SyncConfig) -> Result<StorageService> {
    let bucket = cli
        .bucket
        .clone()
        .or_else(|| config.s3_bucket_name.clone())
        .unwrap_or_else(|| DEFAULT_BUCKET.to_string());

    let store = FsObjectStore::new(&cli.store_dir, &bucket)
        .with_context(|| format!("Failed to open store at {}", cli.store_dir.display()))?;

    Ok(StorageService::new(Arc::new(store), config.storage_retry.clone())
        .with_metrics(Arc::new(TracingMetrics::default())))
}

fn status(storage: StorageService, config: &SyncConfig) -> Result<()> {
    let (manager, source) = load_hash_file(storage, config, None);
    println!("Ledger source: {}", source.to_string().bold());
    print_stats(&manager.stats());
    Ok(())
}

fn verify(storage: StorageService) -> Result<()> {
    let mut manager = HashFileManager::with_storage(storage);
    if !manager.load_from_s3(None, None) {
        bail!("No readable hash file in storage");
    }

    print_stats(&manager.stats());
    if manager.detect_corruption() {
        println!("{}", "Hash file is corrupted (see log for details)".red().bold());
        std::process::exit(2);
    }
    println!("{}", "Hash file is consistent".green());
    Ok(())
}

fn rebuild(storage: StorageService, force: bool) -> Result<()> {
    let mut manager = HashFileManager::with_storage(storage);
    if !force && manager.load_from_s3(None, None) && !manager.detect_corruption() {
        println!("Hash file is healthy; use --force to rebuild anyway");
        return Ok(());
    }

    if !manager.backup_current_hash_file() {
        bail!("Backup failed; refusing to rebuild");
    }
    if !manager.rebuild_from_s3_metadata() {
        bail!("Rebuild from object metadata failed");
    }
    check_interrupted()?;
    if !manager.save_to_s3_atomic() {
        bail!("Saving the rebuilt hash file failed");
    }

    println!("{}", "Hash file rebuilt".green());
    print_stats(&manager.stats());
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let document = read_json(file)?;
    let (valid, errors) = validate_external_hash_file(&document);

    if valid {
        println!("{} {}", "Valid:".green().bold(), file.display());
        return Ok(());
    }

    println!("{} {}", "Invalid:".red().bold(), file.display());
    for error in &errors {
        println!("  - {}", error);
    }
    std::process::exit(1);
}

fn merge(storage: StorageService, config: &SyncConfig, file: &Path, dry_run: bool) -> Result<()> {
    let document = read_json(file)?;
    let (mut manager, source) = load_hash_file(storage, config, None);
    let before = manager.len();

    let merged = manager.merge_with_external_hash_file(&document);
    println!(
        "Merged {} entries into {} ledger ({} -> {} entries)",
        merged.to_string().bold(),
        source,
        before,
        manager.len()
    );

    if dry_run || merged == 0 {
        return Ok(());
    }
    check_interrupted()?;
    if !manager.save_to_s3_atomic() {
        bail!("Saving the merged hash file failed");
    }
    println!("{}", "Hash file saved".green());
    Ok(())
}

fn backup(storage: StorageService) -> Result<()> {
    let manager = HashFileManager::with_storage(storage);
    if !manager.backup_current_hash_file() {
        bail!("Backup failed");
    }
    println!("{}", "Backup complete".green());
    Ok(())
}

fn resume_status(storage: StorageService, sync_id: &str) -> Result<()> {
    let recovery = PartialSyncRecovery::new(storage);
    match recovery.should_resume_sync(sync_id) {
        (true, Some(state)) => {
            println!("{} {}", "Resumable:".green().bold(), state.progress_description());
        }
        _ => match recovery.load_recovery_state(None) {
            Some(state) => println!(
                "{} checkpoint belongs to {} ({})",
                "Not resumable:".yellow().bold(),
                state.sync_id,
                state.progress_description()
            ),
            None => println!("No checkpoint stored"),
        },
    }
    Ok(())
}

fn clear_recovery(storage: StorageService) -> Result<()> {
    if !PartialSyncRecovery::new(storage).clear_recovery_state() {
        bail!("Failed to clear recovery state");
    }
    println!("{}", "Recovery state cleared".green());
    Ok(())
}

fn read_json(file: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", file.display()))
}

fn print_stats(stats: &HashFileStats) {
    println!(
        "Entries: {}  Total size: {:.2} GiB  Unknown hashes: {}",
        stats.entries,
        stats.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
        stats.unknown_hashes
    );
    println!(
        "Last updated: {}",
        stats.last_updated.as_deref().unwrap_or("never")
    );
    for (platform, count) in &stats.per_platform {
        println!("  {:<20} {}", platform, count);
    }
}

fn check_interrupted() -> Result<()> {
    if is_interrupted() {
        bail!("Interrupted before saving; storage left unchanged");
    }
    Ok(())
}

// Signal handler for graceful shutdown
fn setup_signal_handlers() -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                eprintln!("\nInterrupt received, finishing the current step...");
                bottle_sync::set_interrupted();
            }
        }
    });

    Ok(())
}
