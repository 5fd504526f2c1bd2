use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gleaner_client::{HttpExtractorFactory, ReqwestFetcher};
use gleaner_core::consolidate::Consolidator;
use gleaner_core::models::Category;
use gleaner_core::orchestrator::{RunEvent, RunReporter, TracingRunReporter};
use gleaner_core::task::WorkerStatus;
use gleaner_core::{Orchestrator, OutputManager, RunConfig};
use gleaner_db::{Database, DatabaseConfig, RecordRepository};

const DEFAULT_OUTPUT_DIR: &str = "output";
const DATABASE_FILE: &str = "gleaner.db";

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Parallel article collector")]
struct Cli {
    /// Directory for partial files, category files, the combined CSV and summaries
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Database URL (falls back to DATABASE_URL, then to a SQLite file in the
    /// output directory)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in a configuration file and consolidate the results
    Run {
        /// Path to the JSON run configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Number of workers (clamped to the configured bounds)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Only run tasks in this category (repeatable: blog, news, rss)
        #[arg(long = "category")]
        categories: Vec<Category>,
    },

    /// Consolidate partial files left behind by an earlier run
    Consolidate,

    /// Print store statistics as JSON
    Stats,

    /// Show the most recently scraped records
    Recent {
        /// Number of records to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Search stored records by title, summary and tags
    Search {
        /// Text to look for (case-insensitive)
        term: String,

        /// Maximum number of matches to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gleaner=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            categories,
        } => {
            let run_config = RunConfig::from_file(&config)
                .with_context(|| format!("Invalid run configuration: {}", config.display()))?;
            let output_dir = cli
                .output_dir
                .or_else(|| run_config.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
            let repo = connect_db(cli.database_url.as_deref(), &output_dir).await?;
            cmd_run(run_config, workers, &categories, &output_dir, repo).await?;
        }
        Commands::Consolidate => {
            let output_dir = output_dir_or_default(cli.output_dir);
            let repo = connect_db(cli.database_url.as_deref(), &output_dir).await?;
            cmd_consolidate(&output_dir, repo).await?;
        }
        Commands::Stats => {
            let output_dir = output_dir_or_default(cli.output_dir);
            let repo = connect_db(cli.database_url.as_deref(), &output_dir).await?;
            let stats = repo.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Recent { limit } => {
            let output_dir = output_dir_or_default(cli.output_dir);
            let repo = connect_db(cli.database_url.as_deref(), &output_dir).await?;
            cmd_recent(limit, &repo).await?;
        }
        Commands::Search { term, limit } => {
            let output_dir = output_dir_or_default(cli.output_dir);
            let repo = connect_db(cli.database_url.as_deref(), &output_dir).await?;
            cmd_search(&term, limit, &repo).await?;
        }
    }

    Ok(())
}

fn output_dir_or_default(output_dir: Option<PathBuf>) -> PathBuf {
    output_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

/// Open and migrate the record store.
async fn connect_db(database_url: Option<&str>, output_dir: &Path) -> Result<RecordRepository> {
    let config = match database_url {
        Some(url) => DatabaseConfig::new(url),
        None if std::env::var_os("DATABASE_URL").is_some() => DatabaseConfig::from_env()?,
        None => {
            std::fs::create_dir_all(output_dir).with_context(|| {
                format!("Failed to create output directory: {}", output_dir.display())
            })?;
            DatabaseConfig::sqlite_file(output_dir.join(DATABASE_FILE))
        }
    };

    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;

    Ok(db.record_repo())
}

async fn cmd_run(
    run_config: RunConfig,
    workers: Option<usize>,
    categories: &[Category],
    output_dir: &Path,
    repo: RecordRepository,
) -> Result<()> {
    let tasks = run_config.tasks_in(categories);
    if tasks.is_empty() {
        anyhow::bail!("No tasks match the requested categories {categories:?}");
    }

    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    let factory = HttpExtractorFactory::new(fetcher)?;
    let orchestrator_config = run_config.orchestrator_config(workers);

    tracing::info!(
        tasks = tasks.len(),
        workers = orchestrator_config.worker_count(),
        output = %output_dir.display(),
        "Starting run"
    );

    let mut orchestrator = Orchestrator::new(
        orchestrator_config,
        factory,
        repo,
        OutputManager::new(output_dir),
    )
    .with_run_reporter(Arc::new(ConsoleRunReporter));

    let report = orchestrator.run(tasks).await?;
    let stats = &report.stats;

    println!("\nRun finished in {:.1}s", stats.duration.as_secs_f64());
    println!(
        "  tasks: {} succeeded, {} failed ({:.1}% success)",
        stats.successful,
        stats.failed,
        stats.success_rate()
    );
    println!(
        "  records: {} ({} reclassified, {} unclassified)",
        stats.records, stats.reclassified, stats.unclassified
    );
    if let Some(consolidation) = &report.consolidation {
        println!(
            "  store: {} inserted, {} updated, {} unchanged",
            consolidation.load.inserted, consolidation.load.updated, consolidation.load.unchanged
        );
    }
    if let Some(error) = &report.consolidation_error {
        println!("  consolidation failed: {error}");
        println!("  partial files were kept; retry with `gleaner consolidate`");
    }
    if let Some(path) = &report.summary_file {
        println!("  summary: {}", path.display());
    }
    if !report.shutdown.leftover_tasks.is_empty() {
        let ids: Vec<_> = report.shutdown.leftover_tasks.iter().map(|t| t.id).collect();
        println!("  unfinished tasks: {ids:?}");
    }

    Ok(())
}

async fn cmd_consolidate(output_dir: &Path, repo: RecordRepository) -> Result<()> {
    let report = Consolidator::new(OutputManager::new(output_dir), repo)
        .consolidate()
        .await
        .context("Consolidation failed; partial files were kept")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_recent(limit: usize, repo: &RecordRepository) -> Result<()> {
    let records = repo.recent(limit).await?;

    if records.is_empty() {
        println!("No records stored yet");
        return Ok(());
    }

    println!("Most recent {} records:\n", records.len());
    for record in &records {
        let category = record.category.map_or("unclassified", |c| c.as_str());
        println!(
            "  [{}] {} {} ({})",
            category,
            record.scraped_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.title,
            record.url,
        );
    }

    Ok(())
}

async fn cmd_search(term: &str, limit: usize, repo: &RecordRepository) -> Result<()> {
    let records = repo.search(term, limit).await?;

    if records.is_empty() {
        println!("No records match '{term}'");
        return Ok(());
    }

    println!("{} records matching '{}':\n", records.len(), term);
    for record in &records {
        let category = record.category.map_or("unclassified", |c| c.as_str());
        println!("  [{}] {} ({})", category, record.title, record.url);
        if let Some(summary) = &record.summary {
            let preview: String = summary.chars().take(120).collect();
            println!("      {preview}");
        }
    }

    Ok(())
}

/// Prints the progress block to stdout and logs everything else through
/// tracing.
struct ConsoleRunReporter;

impl RunReporter for ConsoleRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Progress(snapshot) => {
                println!(
                    "\nProgress: {}/{} ({:.1}%) | {} succeeded, {} failed",
                    snapshot.completed,
                    snapshot.total,
                    snapshot.percent(),
                    snapshot.succeeded,
                    snapshot.failed
                );
                for (worker_id, status) in &snapshot.workers {
                    let marker = match status {
                        WorkerStatus::Busy => "*",
                        WorkerStatus::Idle => " ",
                    };
                    println!("  {marker} {worker_id}: {status}");
                }
            }
            other => TracingRunReporter.report(other),
        }
    }
}
