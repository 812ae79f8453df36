//! # Patrika Assist CLI (`assist`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `assist serve` | Start the HTTP server |
//! | `assist ingest <file.jsonl>` | Bulk-ingest newline-delimited JSON |
//! | `assist ingest-text <file>` | Ingest one plain-text document |
//! | `assist ask "<query>"` | Run one chat turn, streaming to stdout |
//! | `assist classify "<query>"` | Show the intent and strategy for a query |
//! | `assist chunk <file>` | Dry-run chunking report |
//! | `assist query "<text>"` | Raw similarity search |
//! | `assist stats` | Vector counts per namespace |
//! | `assist delete --filter k=v` | Delete chunks matching a metadata filter |
//! | `assist clear --yes` | Remove every vector from the index |
//!
//! With `index.provider = "memory"` every invocation starts from an empty
//! index, so `ingest` followed by `query` only makes sense against Pinecone.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use patrika_assist::config::{self, Config};
use patrika_assist::progress::ProgressMode;
use patrika_assist::server;
use patrika_assist::services::Services;
use patrika_assist_core::chunk::{chunk_text, preview};
use patrika_assist_core::envelope::StreamEnvelope;
use patrika_assist_core::models::{Document, MetadataFilter, MetadataValue};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "./config/assist.toml";

/// Patrika Assist: a retrieval-augmented chatbot backend.
#[derive(Parser)]
#[command(name = "assist", version, about = "Patrika Assist: retrieval-augmented chat for Rajasthan Patrika")]
struct Cli {
    /// Path to the TOML configuration file. Defaults to `./config/assist.toml`
    /// when it exists, built-in defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging for this crate.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Ingest a JSONL file: one JSON object per line.
    Ingest {
        file: PathBuf,

        /// Progress on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Ingest a plain-text file as one document.
    IngestText {
        file: PathBuf,

        #[arg(long, default_value = "text")]
        source_type: String,

        /// Stable id for the document. Derived from the filename when omitted.
        #[arg(long)]
        source_id: Option<String>,
    },

    /// Ask one question and stream the answer to stdout.
    Ask { query: String },

    /// Show how a query would be classified and routed.
    Classify { query: String },

    /// Show how a file would be chunked without embedding anything.
    Chunk {
        file: PathBuf,

        /// Override `[chunking].max_chunk_bytes`.
        #[arg(long)]
        max_bytes: Option<usize>,
    },

    /// Similarity search against the vector index.
    Query {
        text: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Metadata equality filter, repeatable: `--filter source_type=jsonl`.
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },

    /// Show vector counts and dimension of the index.
    Stats,

    /// Delete every chunk whose metadata matches all filters.
    Delete {
        #[arg(long = "filter", value_name = "KEY=VALUE", required = true)]
        filters: Vec<String>,
    },

    /// Remove every vector from the index.
    Clear {
        /// Required; there is no undo.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "patrika_assist=debug,patrika_assist_core=debug,tower_http=debug"
    } else {
        "patrika_assist=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Ingest { file, progress } => run_ingest(&cfg, &file, progress).await?,
        Commands::IngestText {
            file,
            source_type,
            source_id,
        } => run_ingest_text(&cfg, &file, source_type, source_id).await?,
        Commands::Ask { query } => run_ask(&cfg, &query).await?,
        Commands::Classify { query } => run_classify(&cfg, &query).await?,
        Commands::Chunk { file, max_bytes } => run_chunk(&cfg, &file, max_bytes)?,
        Commands::Query {
            text,
            top_k,
            filters,
        } => run_query(&cfg, &text, top_k, &filters).await?,
        Commands::Stats => run_stats(&cfg).await?,
        Commands::Delete { filters } => run_delete(&cfg, &filters).await?,
        Commands::Clear { yes } => run_clear(&cfg, yes).await?,
    }

    Ok(())
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => {
            tracing::debug!("no config file; using defaults");
            Ok(Config::default())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn run_ingest(cfg: &Config, file: &Path, progress: Option<ProgressMode>) -> Result<()> {
    let content =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file_name(file);
    patrika_assist::ingest::validate_upload(Some(&filename), &content, cfg.server.max_upload_bytes)?;

    let services = Services::from_config(cfg)?;
    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let report = services
        .ingestor
        .ingest_jsonl(&content, &filename, reporter.as_ref())
        .await?;

    println!("ingest {}", report.filename);
    println!("  objects: {}", report.total_objects);
    println!("  chunks: {}", report.total_chunks);
    println!("  stored: {}", report.successful_stores);
    println!("  failed: {}", report.failed_stores);
    println!("  success rate: {:.2}%", report.success_rate);
    for e in &report.line_errors {
        println!("  line {}: {}", e.line, e.message);
    }
    Ok(())
}

async fn run_ingest_text(
    cfg: &Config,
    file: &Path,
    source_type: String,
    source_id: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let services = Services::from_config(cfg)?;
    let doc = Document {
        source_id,
        text,
        filename: file_name(file),
        source_type,
        ..Default::default()
    };
    let report = services.ingestor.upsert_document(&doc).await;
    println!("ingest-text {}", doc.filename);
    println!("  chunks: {}", report.chunks);
    println!("  stored: {}", report.stored);
    println!("  failed: {}", report.failed);
    for id in &report.ids {
        println!("  {}", id);
    }
    Ok(())
}

async fn run_ask(cfg: &Config, query: &str) -> Result<()> {
    let query = patrika_assist::error::validate_query(query)?;
    let services = Services::from_config(cfg)?;
    let mut handle = services.engine.start_turn(query);
    let mut stdout = std::io::stdout();

    while let Some(envelope) = handle.events.recv().await {
        match envelope {
            StreamEnvelope::Chunk { text, .. } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEnvelope::Complete(turn) => {
                writeln!(stdout)?;
                writeln!(stdout)?;
                writeln!(stdout, "[{}] {}", turn.intent, turn.support_menu.label)?;
                for option in turn.support_menu.options {
                    writeln!(stdout, "  - {}", option)?;
                }
                return Ok(());
            }
            StreamEnvelope::Error { message } => {
                writeln!(stdout)?;
                bail!("turn failed: {}", message);
            }
        }
    }
    bail!("turn ended without a result")
}

async fn run_classify(cfg: &Config, query: &str) -> Result<()> {
    let query = patrika_assist::error::validate_query(query)?;
    let services = Services::from_config(cfg)?;
    let plan = services.engine.router().plan(query).await;
    println!("intent: {}", plan.intent);
    println!("strategy: {:?}", plan.strategy);
    println!("shortcut: {}", plan.shortcut);
    println!("menu: {} {:?}", plan.menu.label, plan.menu.options);
    Ok(())
}

fn run_chunk(cfg: &Config, file: &Path, max_bytes: Option<usize>) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let max_bytes = max_bytes.unwrap_or(cfg.chunking.max_chunk_bytes);
    if max_bytes == 0 {
        bail!("--max-bytes must be > 0");
    }
    let chunks = chunk_text(&text, max_bytes);

    println!("chunk {} (dry-run)", file.display());
    println!("  input bytes: {}", text.len());
    println!("  max bytes: {}", max_bytes);
    println!("  chunks: {}", chunks.len());
    for c in &chunks {
        let flag = if c.truncated { "  [truncated]" } else { "" };
        println!(
            "  #{:<4} {:>7} bytes  {}{}",
            c.chunk_index,
            c.text.len(),
            preview(&c.text.replace('\n', " "), 60),
            flag
        );
    }
    Ok(())
}

async fn run_query(cfg: &Config, text: &str, top_k: Option<usize>, filters: &[String]) -> Result<()> {
    let text = patrika_assist::error::validate_query(text)?;
    let filter = parse_filters(filters)?;

    let services = Services::from_config(cfg)?;
    let retriever = services.engine.retriever();
    let top_k = top_k.unwrap_or_else(|| retriever.top_k());
    let filter = (!filter.is_empty()).then_some(filter);
    let matches = retriever.query_index(text, top_k, filter.as_ref()).await?;

    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, m) in matches.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, m.score, m.id);
        if let Some(filename) = &m.metadata.filename {
            println!("    file: {}", filename);
        }
        if let Some(text) = &m.metadata.text {
            println!("    {}", preview(&text.replace('\n', " "), 120));
        }
    }
    Ok(())
}

fn parse_filters(filters: &[String]) -> Result<MetadataFilter> {
    let mut filter = MetadataFilter::new();
    for raw in filters {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("invalid filter '{}': expected KEY=VALUE", raw);
        };
        filter = filter.eq(key.trim(), MetadataValue::parse_loose(value.trim()));
    }
    Ok(filter)
}

async fn run_stats(cfg: &Config) -> Result<()> {
    let services = Services::from_config(cfg)?;
    let stats = services.ingestor.index_stats().await?;
    println!("index {} ({})", cfg.index.name, cfg.index.provider);
    println!("  dimension: {}", stats.dimension);
    println!("  vectors: {}", stats.total_vector_count);
    println!("  fullness: {:.4}", stats.index_fullness);
    for (ns, s) in &stats.namespaces {
        let name = if ns.is_empty() { "(default)" } else { ns.as_str() };
        println!("  namespace {}: {}", name, s.vector_count);
    }
    Ok(())
}

async fn run_delete(cfg: &Config, filters: &[String]) -> Result<()> {
    let filter = parse_filters(filters)?;
    let services = Services::from_config(cfg)?;
    match services.ingestor.delete_documents(&filter).await? {
        Some(n) => println!("deleted {} vectors", n),
        None => println!("delete request accepted"),
    }
    Ok(())
}

async fn run_clear(cfg: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear index '{}' without --yes", cfg.index.name);
    }
    let services = Services::from_config(cfg)?;
    services.ingestor.clear_index().await?;
    println!("index {} cleared", cfg.index.name);
    Ok(())
}
