use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use event_indexer::commands::{
    IngestOptions, ingest, log_report, parse_filter, reset_collection, search, show_status,
};
use event_indexer::config::{Config, get_config_dir, run_interactive_config, show_config};
use event_indexer::{IndexerError, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "event-indexer")]
#[command(about = "Index event records into a LanceDB vector collection for semantic search")]
#[command(version)]
struct Cli {
    /// Configuration directory (defaults to ~/.event-indexer or $EVENT_INDEXER_HOME)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama connection and ingestion settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Load, embed and index the event source
    Ingest(IngestArgs),
    /// Semantic search over indexed events
    Search {
        /// Free-text query
        query: String,
        /// Maximum number of results
        #[arg(long, short = 'k', default_value_t = 5)]
        limit: usize,
        /// Exact-match metadata filter, e.g. --where location=Bangalore
        #[arg(long = "where", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Show collection size and model health
    Status,
    /// Drop every indexed document
    Reset {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Args, Debug, Default)]
struct IngestArgs {
    /// Event source file, overriding the configured one
    #[arg(long)]
    source: Option<PathBuf>,
    /// Drop the existing collection before indexing
    #[arg(long, conflicts_with = "no_recreate")]
    recreate: bool,
    /// Keep the existing collection and upsert into it
    #[arg(long)]
    no_recreate: bool,
    /// Documents per upsert batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Upsert attempts per batch
    #[arg(long)]
    max_retries: Option<u32>,
    /// Embedding model identifier
    #[arg(long)]
    model: Option<String>,
    /// Vector length produced by the embedding model
    #[arg(long)]
    embedding_dimension: Option<u32>,
    /// Build documents and report counts without embedding or storing them
    #[arg(long)]
    dry_run: bool,
}

impl IngestArgs {
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(source) = &self.source {
            config.ingest.source_path = std::path::absolute(source)?;
        }
        if self.recreate {
            config.ingest.recreate = true;
        } else if self.no_recreate {
            config.ingest.recreate = false;
        }
        if let Some(batch_size) = self.batch_size {
            config.ingest.set_batch_size(batch_size)?;
        }
        if let Some(max_retries) = self.max_retries {
            config.ingest.set_max_retries(max_retries)?;
        }
        if let Some(model) = &self.model {
            config.ollama.set_model(model.clone())?;
        }
        if let Some(dimension) = self.embedding_dimension {
            config.ollama.set_embedding_dimension(dimension)?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir().map_err(|e| IndexerError::Config(e.to_string()))?,
    };

    init_tracing(&config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Ingest(args) => {
            let mut config = Config::load(&config_dir)?;
            args.apply(&mut config)?;

            let report = ingest(
                &config,
                IngestOptions {
                    dry_run: args.dry_run,
                },
            )
            .await?;
            log_report(&report);
        }
        Commands::Search {
            query,
            limit,
            filters,
        } => {
            let config = Config::load(&config_dir)?;
            search(&config, &query, limit, &filters).await?;
        }
        Commands::Status => {
            let config = Config::load(&config_dir)?;
            show_status(&config).await?;
        }
        Commands::Reset { yes } => {
            let config = Config::load(&config_dir)?;
            let confirmed = yes
                || Confirm::new()
                    .with_prompt(format!(
                        "Drop collection '{}'? This cannot be undone.",
                        config.ingest.collection_name
                    ))
                    .default(false)
                    .interact()
                    .map_err(anyhow::Error::from)?;

            if confirmed {
                reset_collection(&config).await?;
            } else {
                println!("Reset cancelled.");
            }
        }
    }

    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`), and to the configured log file if any
fn init_tracing(config_dir: &Path) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = Config::load(config_dir)
        .ok()
        .and_then(|config| config.log_file_path());

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}
