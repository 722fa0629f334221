//! Disclosure Delta - quarter-over-quarter disclosure change analysis.
//!
//! Compares consecutive filings per entity, validates every extracted claim
//! and writes a report with one aggregated verdict per quarter pair.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use disclosure_common::logging::init_logging;
use disclosure_common::Config;
use disclosure_delta::{
    open_store, AnomalyDetector, BlobStore, ChangeCache, Corpus, Fact, FactStore, HttpCapability,
    PipelineOrchestrator, PipelineSettings,
};

#[derive(Parser, Debug)]
#[command(name = "disclosure-delta")]
#[command(version)]
#[command(about = "Detect and validate changes between consecutive company filings.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.disclosure/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline over parsed filings
    Run {
        /// Parsed corpus: {entity: {quarter: {section: text}}}
        #[arg(short, long)]
        input: PathBuf,

        /// Write the JSON report here (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a markdown summary
        #[arg(long)]
        markdown: Option<PathBuf>,

        /// Override the worker limit
        #[arg(long)]
        workers: Option<usize>,

        /// Skip market validation even when enabled in config
        #[arg(long)]
        no_market: bool,
    },

    /// Detect numeric anomalies in the fact store
    Anomalies {
        /// Restrict to one entity
        #[arg(long)]
        entity: Option<String>,
    },

    /// Manage the fact store
    Facts {
        #[command(subcommand)]
        action: FactsCommands,
    },

    /// Manage the change cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum FactsCommands {
    /// Append facts from a JSON array file
    Import { file: PathBuf },
    /// Remove every stored fact
    Clear,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Show cache statistics
    Stats,
    /// Drop cached records, for one entity or everything
    Clear {
        #[arg(long)]
        entity: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn open_cache(config: &Config, store: Arc<dyn BlobStore>, settings: &PipelineSettings) -> ChangeCache {
    let cache = ChangeCache::new(store, config.storage.cache_key.clone(), settings.sections.clone());
    let loaded = cache.load().await;
    info!(entries = loaded, "Loaded change cache");
    cache
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    info!("Disclosure Delta v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            input,
            output,
            markdown,
            workers,
            no_market,
        } => {
            if let Some(workers) = workers {
                config.pipeline.worker_limit = workers;
            }
            if no_market {
                config.market.enabled = false;
            }
            let settings = Arc::new(PipelineSettings::from_config(&config)?);

            let corpus: Corpus = read_json(&input).await?;
            let store = open_store(&config)?;
            info!(store = %store.describe(), "Opened storage");

            let cache = Arc::new(open_cache(&config, store.clone(), &settings).await);
            let facts = Arc::new(FactStore::new(store, config.storage.facts_key.clone()));

            let capability = Arc::new(HttpCapability::new(config.capability.clone()));
            if !capability.health_check().await {
                warn!(endpoint = %config.capability.endpoint, "Capability endpoint not healthy, continuing");
            }

            let orchestrator = PipelineOrchestrator::new(settings, capability.clone(), cache, facts)
                .with_search(capability);

            let cancel = orchestrator.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight units");
                    cancel.cancel();
                }
            });

            let report = orchestrator.run(&corpus).await;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    info!(path = %path.display(), "Report written");
                }
                None => println!("{}", json),
            }

            if let Some(path) = markdown {
                tokio::fs::write(&path, report.to_markdown()).await?;
                info!(path = %path.display(), "Markdown summary written");
            }
        }

        Commands::Anomalies { entity } => {
            let store = open_store(&config)?;
            let facts = FactStore::new(store, config.storage.facts_key.clone());
            let loaded = match &entity {
                Some(entity) => facts.facts_for(entity).await,
                None => facts.load().await,
            };

            let lines = AnomalyDetector::default().detect(&loaded);
            if lines.is_empty() {
                println!("No anomalies detected across {} facts.", loaded.len());
            }
            for line in lines {
                println!("{}", line);
            }
        }

        Commands::Facts { action } => {
            let store = open_store(&config)?;
            let facts = FactStore::new(store, config.storage.facts_key.clone());
            match action {
                FactsCommands::Import { file } => {
                    let imported: Vec<Fact> = read_json(&file).await?;
                    let count = imported.len();
                    let total = facts.append(imported).await?;
                    println!("Imported {} facts ({} stored).", count, total);
                }
                FactsCommands::Clear => {
                    facts.clear().await?;
                    println!("Fact store cleared.");
                }
            }
        }

        Commands::Cache { action } => {
            let settings = PipelineSettings::from_config(&config)?;
            let store = open_store(&config)?;
            let cache = open_cache(&config, store, &settings).await;
            match action {
                CacheCommands::Stats => {
                    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
                }
                CacheCommands::Clear { entity } => {
                    match entity {
                        Some(entity) => {
                            let removed = cache.invalidate(&entity);
                            println!("Removed {} cache entries for {}.", removed, entity);
                        }
                        None => {
                            cache.clear();
                            println!("Change cache cleared.");
                        }
                    }
                    cache.persist().await?;
                }
            }
        }
    }

    Ok(())
}
