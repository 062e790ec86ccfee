use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use parkinsons_etl::config::{Config, StoreBackend};
use parkinsons_etl::domain::{ThresholdFlagMode, VariableStatistic};
use parkinsons_etl::import::import_csv;
use parkinsons_etl::logging;
use parkinsons_etl::pipeline::{BatchTransformer, RunReport, StageContext};
use parkinsons_etl::storage::{DocumentStore, InMemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "parkinsons_etl")]
#[command(about = "Batch transformation job for the Parkinson's telemonitoring dataset")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = parkinsons_etl::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run Stage 0 and Stages 1-8 against the configured store
    Run {
        /// Load this CSV into the source collection (replacing it) before running
        #[arg(long)]
        source: Option<PathBuf>,
        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
        /// Override the configured threshold flag mode
        #[arg(long, value_enum)]
        flag_mode: Option<ThresholdFlagMode>,
    },
    /// Load a CSV file into the source collection
    Import {
        csv: PathBuf,
        /// Clear the source collection first
        #[arg(long)]
        replace: bool,
    },
    /// Show collection counts, the statistics table and source indexes
    Inspect,
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing persists after exit");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.store.path).with_context(|| {
                format!("failed to open store at {}", config.store.path.display())
            })?;
            Ok(Arc::new(store))
        }
    }
}

fn print_report(report: &RunReport) {
    println!("\n📊 Batch run {} ({})", report.run_id, report.engine);
    println!("   Reset documents: {}", report.reset_documents);
    for stage in &report.stages {
        println!(
            "   {}. {:<18} processed {:>6}  written {:>6}  {:>6} ms  {}",
            stage.number,
            stage.name,
            stage.processed_count,
            stage.written_count,
            stage.duration_ms,
            stage.message
        );
    }
    for (collection, fp) in &report.fingerprints {
        println!(
            "   🔑 {:<32} {:>6} docs  {}",
            collection,
            fp.documents,
            &fp.sha256[..12]
        );
    }
    if let Some(duration) = report.duration() {
        println!("   Duration: {} ms", duration.num_milliseconds());
    }
}

async fn run_command(
    command: Commands,
    config: &Config,
    store: Arc<dyn DocumentStore>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            source,
            report,
            flag_mode,
        } => {
            println!("🚀 Running batch transformation...");
            if let Some(csv) = source {
                println!("\n📥 Loading {}...", csv.display());
                let summary = import_csv(
                    store.as_ref(),
                    &config.collections.source,
                    &csv,
                    true,
                    config.pipeline.batch_size,
                )
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
                println!("   Rows: {}", summary.rows);
            }

            let mut ctx = StageContext::from_config(config, store.clone())?;
            if let Some(mode) = flag_mode {
                ctx.flag_mode = mode;
            }
            let transformer = BatchTransformer::new(ctx);
            let run = transformer.run().await?;
            print_report(&run);

            if let Some(path) = report {
                run.write_json(&path)
                    .with_context(|| format!("failed to write report to {}", path.display()))?;
                println!("\n📝 Report written to {}", path.display());
            }
            println!("✅ Batch run completed successfully");
        }
        Commands::Import { csv, replace } => {
            println!("📥 Importing {}...", csv.display());
            let summary = import_csv(
                store.as_ref(),
                &config.collections.source,
                &csv,
                replace,
                config.pipeline.batch_size,
            )
            .await
            .with_context(|| format!("failed to import {}", csv.display()))?;
            println!("   Rows: {}", summary.rows);
            println!("   Empty cells: {}", summary.missing_cells);
            if replace {
                println!("   Replaced: {}", summary.replaced);
            }
            println!("✅ Import completed successfully");
        }
        Commands::Inspect => {
            let collections = &config.collections;
            println!("\n📦 Collections ({}):", store.engine());
            let source = collections.source.as_str();
            for name in std::iter::once(source).chain(collections.derived()) {
                println!("   {:<32} {:>8}", name, store.count(name).await?);
            }

            let mut stats = store
                .find_all(&collections.statistics)
                .await?
                .iter()
                .map(VariableStatistic::from_document)
                .collect::<parkinsons_etl::Result<Vec<_>>>()?;
            stats.sort_by_key(|s| s.ordinal);
            if stats.is_empty() {
                println!("\n⚠️  No statistics yet, run the batch job first");
            } else {
                println!("\n📈 Statistics:");
                for s in &stats {
                    println!(
                        "   {:>2}. {:<16} mean {:>14}  sd {:>14}  n {:>6}",
                        s.ordinal,
                        s.variable,
                        s.mean.map(|m| format!("{m:.6}")).unwrap_or_else(|| "-".into()),
                        s.stddev.map(|m| format!("{m:.6}")).unwrap_or_else(|| "-".into()),
                        s.count
                    );
                }
            }

            let indexes = store.list_indexes(&collections.source).await?;
            println!("\n🗂️  Indexes on {}:", collections.source);
            if indexes.is_empty() {
                println!("   (none)");
            }
            for index in indexes {
                println!("   {}", index.name);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let guard = logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    let store = open_store(&config)?;
    let outcome = run_command(cli.command, &config, store.clone()).await;

    if let Err(e) = store.close().await {
        warn!("Failed to close store: {}", e);
    }

    if let Err(e) = outcome {
        error!("❌ Command failed: {:#}", e);
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}
