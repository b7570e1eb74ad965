use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::chunker::{self, ChunkOptions, TextFormat};
use crate::client::{self, DirectSearcher, FastSearchClient, SearchOptions};
use crate::config::Config;
use crate::engine::SearchMode;
use crate::error::Error;
use crate::models::FastEmbedFactory;
use crate::store::{ChunkInsert, SearchStore};

#[derive(Parser)]
#[command(
    name = "fastsearch",
    version,
    about = "Local hybrid text search (BM25 + vectors) with a warm-model daemon"
)]
pub struct Cli {
    /// Store path (also FASTSEARCH_DB).
    #[arg(long, global = true, env = "FASTSEARCH_DB")]
    pub db: Option<PathBuf>,
    /// Config file path (also FASTSEARCH_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run and manage the background daemon
    Daemon(DaemonOpts),
    /// Chunk, embed, and index files into the store
    Index(IndexOpts),
    /// Query the store
    Search(SearchCmdOpts),
    /// Remove a source (exact path or unique suffix) from the store
    Delete(DeleteOpts),
    /// Show store statistics
    Stats(StatsOpts),
    /// Inspect or create the configuration file
    Config(ConfigOpts),
}

#[derive(clap::Args)]
pub struct DaemonOpts {
    #[command(subcommand)]
    pub action: DaemonAction,
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Start the daemon in the foreground
    Start,
    /// Stop a running daemon
    Stop,
    /// Show daemon status
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
pub struct IndexOpts {
    /// Files to index
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Record this source name instead of the file path (single file only)
    #[arg(long)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Bm25,
    Vector,
    Hybrid,
}

impl From<ModeArg> for SearchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Bm25 => SearchMode::Bm25,
            ModeArg::Vector => SearchMode::Vector,
            ModeArg::Hybrid => SearchMode::Hybrid,
        }
    }
}

#[derive(clap::Args)]
pub struct SearchCmdOpts {
    /// The query text
    pub query: String,
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,
    #[arg(long, value_enum, default_value = "hybrid")]
    pub mode: ModeArg,
    /// Re-order the top candidates with the cross-encoder
    #[arg(long)]
    pub rerank: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct DeleteOpts {
    /// Exact source path, or a suffix matching exactly one source
    pub source: String,
}

#[derive(clap::Args)]
pub struct StatsOpts {
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct ConfigOpts {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write the default configuration file
    Init,
    /// Print the effective configuration
    Show,
}

// ============================================================================
// Command execution
// ============================================================================

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Commands::Daemon(opts) => run_daemon(opts, config).await,
        Commands::Index(opts) => run_index(cli.db, opts, config).await,
        Commands::Search(opts) => run_search(cli.db, opts, config).await,
        Commands::Delete(opts) => run_delete(cli.db, opts),
        Commands::Stats(opts) => run_stats(cli.db, opts),
        Commands::Config(opts) => run_config(cli.config, opts, config),
    }
}

async fn run_daemon(opts: DaemonOpts, config: Config) -> anyhow::Result<()> {
    match opts.action {
        DaemonAction::Start => {
            info!("starting fastsearch daemon");
            crate::daemon::run(config, Arc::new(FastEmbedFactory)).await?;
            Ok(())
        }
        DaemonAction::Stop => {
            let mut client = FastSearchClient::from_config(&config);
            match client.shutdown().await {
                Ok(_) => {
                    println!("fastsearch daemon stopped");
                    Ok(())
                }
                Err(Error::DaemonNotRunning(_)) => bail!("daemon is not running"),
                Err(e) => Err(e.into()),
            }
        }
        DaemonAction::Status { json } => {
            let mut client = FastSearchClient::from_config(&config);
            let status = match client.status().await {
                Ok(status) => status,
                Err(Error::DaemonNotRunning(_)) => bail!("daemon is not running"),
                Err(e) => return Err(e.into()),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let uptime = status.uptime_seconds;
                println!("fastsearch daemon");
                println!("  uptime:   {}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60);
                println!("  requests: {}", status.request_count);
                println!(
                    "  memory:   {} MB / {} MB",
                    status.total_memory_mb, status.max_memory_mb
                );
                println!("  socket:   {}", status.socket_path);
                if status.loaded_models.is_empty() {
                    println!("  no models loaded");
                } else {
                    println!("  loaded models:");
                    for (slot, info) in &status.loaded_models {
                        println!(
                            "    {slot}: {} MB (idle {}s)",
                            info.memory_mb,
                            info.idle_seconds.unwrap_or(0)
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

async fn run_index(db: Option<PathBuf>, opts: IndexOpts, config: Config) -> anyhow::Result<()> {
    if opts.source.is_some() && opts.files.len() != 1 {
        bail!("--source requires exactly one file");
    }
    let db_path = db.unwrap_or_else(Config::default_db_path);

    // Embed through the daemon when it is up (warm models), else load the
    // embedder in-process.
    let use_daemon = client::daemon_running(&config.daemon.socket_path).await;
    let mut daemon_client = use_daemon.then(|| FastSearchClient::from_config(&config));
    let direct = if use_daemon {
        None
    } else {
        info!("daemon not running, embedding in-process");
        Some(DirectSearcher::new(&config, Arc::new(FastEmbedFactory)))
    };

    for file in &opts.files {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read {}", file.display()))?;

        let format = match file.extension().and_then(|e| e.to_str()) {
            Some("md") | Some("markdown") => TextFormat::Markdown,
            _ => TextFormat::Plain,
        };
        let chunks = chunker::chunk_text(
            &text,
            &ChunkOptions {
                format,
                ..ChunkOptions::default()
            },
        );
        if chunks.is_empty() {
            println!("skipping empty file {}", file.display());
            continue;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = match (&mut daemon_client, &direct) {
            (Some(client), _) => client.embed(&texts).await?.embeddings,
            (None, Some(direct)) => direct.embed(&texts).await?,
            (None, None) => bail!("no embedding path available"),
        };
        let dimension = embeddings
            .first()
            .map(|e| e.len())
            .context("embedder returned no vectors")?;

        let source = opts
            .source
            .clone()
            .unwrap_or_else(|| file.display().to_string());
        let items: Vec<ChunkInsert> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (chunk, embedding))| ChunkInsert {
                source: source.clone(),
                chunk_index: i as u32,
                content: chunk.text,
                embedding,
                metadata: chunk.metadata,
            })
            .collect();

        let mut store = SearchStore::create(&db_path, dimension)?;
        let ids = store.replace_source(&source, &items)?;
        println!("indexed {} chunks from {}", ids.len(), source);
    }

    Ok(())
}

async fn run_search(
    db: Option<PathBuf>,
    opts: SearchCmdOpts,
    config: Config,
) -> anyhow::Result<()> {
    let search_opts = SearchOptions {
        db_path: db,
        limit: opts.limit,
        mode: opts.mode.into(),
        rerank: opts.rerank,
    };

    let result = client::search_auto(
        &config,
        Arc::new(FastEmbedFactory),
        &opts.query,
        &search_opts,
    )
    .await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!(
        "{} results for \"{}\" ({} mode, {:.1} ms)",
        result.results.len(),
        result.query,
        result.mode.as_str(),
        result.search_time_ms
    );
    for hit in &result.results {
        let score = hit
            .rerank_score
            .map(|s| format!("rerank {s:.3}"))
            .or_else(|| hit.rrf_score.map(|s| format!("rrf {s:.4}")))
            .unwrap_or_else(|| format!("rank {}", hit.rank));
        println!("{:>3}. {}#{} ({score})", hit.rank, hit.source, hit.chunk_index);
        let preview: String = hit.content.chars().take(160).collect();
        println!("     {}", preview.replace('\n', " "));
    }

    Ok(())
}

fn run_delete(db: Option<PathBuf>, opts: DeleteOpts) -> anyhow::Result<()> {
    let db_path = db.unwrap_or_else(Config::default_db_path);
    let mut store = SearchStore::open(&db_path)?;
    let deleted = store.delete_source(&opts.source)?;
    if deleted == 0 {
        println!("no chunks matched {}", opts.source);
    } else {
        println!("deleted {deleted} chunks");
    }
    Ok(())
}

fn run_stats(db: Option<PathBuf>, opts: StatsOpts) -> anyhow::Result<()> {
    let db_path = db.unwrap_or_else(Config::default_db_path);
    let store = SearchStore::open(&db_path)?;
    let stats = store.stats()?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("chunks:  {}", stats.chunk_count);
    println!("sources: {}", stats.source_count);
    println!("size:    {:.2} MB", stats.bytes as f64 / (1024.0 * 1024.0));
    if !stats.top_sources.is_empty() {
        println!("top sources:");
        for entry in &stats.top_sources {
            println!("  {:>6}  {}", entry.chunks, entry.source);
        }
    }
    Ok(())
}

fn run_config(
    path: Option<PathBuf>,
    opts: ConfigOpts,
    config: Config,
) -> anyhow::Result<()> {
    match opts.action {
        ConfigAction::Init => {
            let target = path.unwrap_or_else(crate::config::default_config_path);
            Config::write_default(&target)?;
            println!("wrote {}", target.display());
            Ok(())
        }
        ConfigAction::Show => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
