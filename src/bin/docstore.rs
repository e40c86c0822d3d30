//! Document store maintenance tool
//!
//! Inspects and maintains a log data store directory offline.
//!
//! # Examples
//!
//! ```bash
//! # Storage and bloat overview
//! docstore --data-dir data/docstore stats
//!
//! # Per-chunk statistics as JSON
//! docstore --data-dir data/docstore chunks --json
//!
//! # Compact when bloat exceeds the configured ratio
//! docstore --data-dir data/docstore compact
//!
//! # Dump the first 10 documents
//! docstore --data-dir data/docstore dump --limit 10 --doc-type music
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use photondb_docstore::docstore::{
    compression, BackingStore, Document, DocumentStore, DocumentStoreConfig, DocumentTypeRepo,
    LogDataStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB document store maintenance tool
#[derive(Parser, Debug)]
#[command(name = "docstore")]
#[command(version = photondb_docstore::VERSION)]
#[command(about = "Inspect and maintain PhotonDB document store directories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Document store directory
    #[arg(
        long,
        global = true,
        default_value = "data/docstore",
        env = "PHOTONDB_DOCSTORE_DATA"
    )]
    data_dir: PathBuf,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "PHOTONDB_DOCSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Also write daily rolling log files here
    #[arg(long, global = true, env = "PHOTONDB_DOCSTORE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show storage statistics
    Stats(OutputArgs),

    /// Show per-chunk statistics
    Chunks(OutputArgs),

    /// Rewrite live data to drop bloat
    Compact(CompactArgs),

    /// Print stored documents as JSON lines
    Dump(DumpArgs),

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CompactArgs {
    /// Compact even if bloat is below the configured ratio
    #[arg(short, long)]
    force: bool,
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Stop after this many documents
    #[arg(short, long)]
    limit: Option<usize>,

    /// Document types to decode; raw payloads are printed when none is given
    #[arg(long = "doc-type")]
    doc_types: Vec<String>,

    /// Omit document ids
    #[arg(long)]
    fields_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Stats(args) => stats_command(cli.data_dir, config, args),
        Commands::Chunks(args) => chunks_command(cli.data_dir, config, args),
        Commands::Compact(args) => compact_command(cli.data_dir, config, args).await,
        Commands::Dump(args) => dump_command(cli.data_dir, config, args),
        Commands::Version => {
            println!("photondb-docstore {}", photondb_docstore::VERSION);
            Ok(())
        }
    }
}

/// Console logging plus optional rolling files
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "docstore.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<DocumentStoreConfig> {
    match &cli.config {
        Some(path) => DocumentStoreConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(DocumentStoreConfig::default()),
    }
}

fn open_store(data_dir: &Path, config: DocumentStoreConfig) -> anyhow::Result<DocumentStore> {
    DocumentStore::open(data_dir, config)
        .with_context(|| format!("Failed to open document store at {}", data_dir.display()))
}

fn stats_command(
    data_dir: PathBuf,
    config: DocumentStoreConfig,
    args: OutputArgs,
) -> anyhow::Result<()> {
    let store = open_store(&data_dir, config)?;
    let stats = store.storage_stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Directory:        {}", data_dir.display());
    println!("Disk usage:       {} bytes", stats.disk_usage);
    println!(
        "Disk bloat:       {} bytes ({:.1}%)",
        stats.disk_bloat,
        stats.bloat_ratio() * 100.0
    );
    println!("Last serial:      {}", stats.last_serial_num);
    println!("Flushed serial:   {}", stats.last_flushed_serial_num);
    println!("Doc id limit:     {}", stats.doc_id_limit);
    println!("Chunks:           {}", store.file_chunk_stats().len());
    println!("Memory used:      {} bytes", store.memory_used());
    if let Some(time) = store.last_flush_time() {
        println!("Last flush:       {}", time.to_rfc3339());
    }
    if store.should_compact() {
        println!("Compaction due:   yes");
    }
    Ok(())
}

fn chunks_command(
    data_dir: PathBuf,
    config: DocumentStoreConfig,
    args: OutputArgs,
) -> anyhow::Result<()> {
    let store = open_store(&data_dir, config)?;
    let chunks = store.file_chunk_stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!(
        "{:>10} {:>14} {:>14} {:>7} {:>12} {:>10}",
        "chunk", "bytes", "bloat", "bloat%", "last serial", "lid limit"
    );
    for chunk in chunks {
        println!(
            "{:>10} {:>14} {:>14} {:>6.1}% {:>12} {:>10}",
            chunk.name_id,
            chunk.disk_usage,
            chunk.disk_bloat,
            chunk.bloat_ratio() * 100.0,
            chunk.last_serial_num,
            chunk.doc_id_limit
        );
    }
    Ok(())
}

async fn compact_command(
    data_dir: PathBuf,
    config: DocumentStoreConfig,
    args: CompactArgs,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(&data_dir, config)?);
    let token = store.storage_stats().last_serial_num;

    if !args.force && !store.should_compact() {
        println!(
            "Bloat {:.1}% is below the configured ratio, nothing to do",
            store.storage_stats().bloat_ratio() * 100.0
        );
        return Ok(());
    }

    store.spawn_flush(token).await??;
    let before = store.disk_footprint();
    let compactor = Arc::clone(&store);
    tokio::task::spawn_blocking(move || compactor.compact(token)).await??;
    let after = store.disk_footprint();

    info!(before, after, "Compaction finished");
    println!("Compacted {} → {} bytes", before, after);
    Ok(())
}

fn dump_command(
    data_dir: PathBuf,
    config: DocumentStoreConfig,
    args: DumpArgs,
) -> anyhow::Result<()> {
    let limit = args.limit.unwrap_or(usize::MAX);
    let mut printed = 0usize;

    if args.doc_types.is_empty() {
        let store = LogDataStore::open(&data_dir, config.log)?;
        store.accept(
            &mut |lid: u32, blob: &[u8]| {
                if printed >= limit {
                    return;
                }
                match compression::decode(blob) {
                    Ok(data) => {
                        println!("{}\t{}", lid, String::from_utf8_lossy(&data));
                        printed += 1;
                    }
                    Err(e) => warn!(lid, error = %e, "Skipping undecodable payload"),
                }
            },
            &mut |_: f64| {},
        )?;
        return Ok(());
    }

    let repo = args
        .doc_types
        .iter()
        .fold(DocumentTypeRepo::new(), |repo, name| repo.with_type(name.clone()));
    let store = open_store(&data_dir, config)?;
    store.accept(
        &mut |lid: u32, doc: Document| {
            if printed >= limit {
                return;
            }
            match serde_json::to_string(&doc) {
                Ok(json) => {
                    println!("{}\t{}", lid, json);
                    printed += 1;
                }
                Err(e) => warn!(lid, error = %e, "Failed to print document"),
            }
        },
        &mut |_: f64| {},
        &repo,
        args.fields_only,
    )?;
    Ok(())
}
