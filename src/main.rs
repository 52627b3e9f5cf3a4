use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use lookalike::database::cache_path_for;
use lookalike::{
    AppConfig, FeatureCache, FeatureMode, FolderRole, Pipeline, ScanPhase, ScanProgress,
    ScanSummary,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "lookalike", version, about = "Find visually similar images")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// ONNX feature model
    #[arg(long, global = true, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Compare perceptual hashes only
    #[arg(long, global = true)]
    hash_only: bool,

    /// Do not read or write the feature cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Only scan the top level of each folder
    #[arg(long, global = true)]
    no_recursive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a folder and extract features
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// List images similar to a source image
    Search {
        /// Directory containing the source image
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Source image
        #[arg(short, long, value_name = "FILE")]
        source: PathBuf,
        /// Search this directory instead of the source's own
        #[arg(long, value_name = "DIR")]
        compare: Option<PathBuf>,
        /// Minimum similarity, 0 to 100
        #[arg(short, long)]
        threshold: Option<f32>,
    },

    /// Manage a folder's feature cache
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show entry count and size
    Stats {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
    /// Drop entries whose image no longer exists
    Cleanup {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
    /// Drop every entry
    Reset {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Scan { path } => {
            let path = resolve(&path)?;
            println!("▶ Scanning {}", path.display());

            let (pipeline, bar) = build_pipeline(config)?;
            let summary = benchmark("scan", || pipeline.scan_folder(&path, FolderRole::Primary))
                .await
                .with_context(|| format!("Failed to scan {}", path.display()))?;
            drop(pipeline);
            bar.await?;

            print_summary(&summary);
        }

        Commands::Search {
            path,
            source,
            compare,
            threshold,
        } => {
            let path = resolve(&path)?;
            let source = resolve(&source)?;
            let (pipeline, bar) = build_pipeline(config)?;

            println!("▶ Scanning {}", path.display());
            let summary = pipeline
                .scan_folder(&path, FolderRole::Primary)
                .await
                .with_context(|| format!("Failed to scan {}", path.display()))?;
            print_summary(&summary);

            if let Some(compare) = compare {
                let compare = resolve(&compare)?;
                println!("▶ Scanning {}", compare.display());
                let summary = pipeline
                    .scan_folder(&compare, FolderRole::Compare)
                    .await
                    .with_context(|| format!("Failed to scan {}", compare.display()))?;
                print_summary(&summary);
            }

            let results = pipeline.search(&source, threshold)?;
            let threshold = threshold.unwrap_or(pipeline.config().similarity_threshold);
            drop(pipeline);
            bar.await?;

            if results.is_empty() {
                println!("No images at or above {:.0}% similarity.", threshold);
            } else {
                println!("Found {} similar image(s):", results.len());
                for record in &results {
                    println!("  {:>5.1}%  {}", record.similarity, record.path.display());
                }
            }
        }

        Commands::Cache { command } => match command {
            CacheCmd::Stats { path } => {
                let db_path = cache_path_for(&path);
                if !db_path.exists() {
                    println!("No feature cache in {}", path.display());
                    return Ok(());
                }
                let cache = open_cache(&path)?;
                let stats = cache.statistics()?;
                println!("🗂️  {}", db_path.display());
                println!("   entries: {}", stats.total_entries);
                println!("   size:    {:.1} KiB", stats.database_bytes as f64 / 1024.0);
            }

            CacheCmd::Cleanup { path } => {
                let removed = open_cache(&path)?.cleanup_expired()?;
                println!("🧹 Removed {} expired entr(ies)", removed);
            }

            CacheCmd::Reset { path } => {
                let removed = open_cache(&path)?.reset()?;
                println!("🧹 Removed {} entr(ies)", removed);
            }
        },
    }

    Ok(())
}

/// Settings file (or defaults) with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(model) = &cli.model {
        config.model_path = Some(model.clone());
    }
    if cli.hash_only {
        config.feature_mode = FeatureMode::Hash;
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    if cli.no_recursive {
        config.recursive = false;
    }

    config.validate()?;
    Ok(config)
}

fn build_pipeline(config: AppConfig) -> Result<(Pipeline, tokio::task::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(config)?.with_progress_sender(tx);
    Ok((pipeline, spawn_progress_bar(rx)?))
}

fn spawn_progress_bar(
    mut rx: mpsc::UnboundedReceiver<ScanProgress>,
) -> Result<tokio::task::JoinHandle<()>> {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} {prefix:>12} [{bar:30}] {pos}/{len} {wide_msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    Ok(tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.phase == ScanPhase::Complete {
                bar.finish_and_clear();
                continue;
            }
            if bar.is_finished() {
                bar.reset();
            }
            bar.set_prefix(format!("{:?}", progress.phase));
            bar.set_length(progress.total as u64);
            bar.set_position(progress.processed as u64);
            bar.set_message(progress.current_file);
        }
        bar.finish_and_clear();
    }))
}

fn open_cache(path: &Path) -> Result<FeatureCache> {
    FeatureCache::open_for_folder(path)
        .with_context(|| format!("Failed to open feature cache in {}", path.display()))
}

fn resolve(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("Cannot access {}", path.display()))
}

fn print_summary(summary: &ScanSummary) {
    println!("✨ {} image(s)", summary.total_images);
    if summary.model_available {
        println!(
            "   embeddings: {} cached, {} extracted, {} failed",
            summary.cache_hits, summary.extracted, summary.embedding_failures
        );
    }
    if summary.hashed > 0 {
        println!("   hashes:     {}", summary.hashed);
    }
    if summary.failed > 0 {
        println!("⚠️  {} image(s) could not be read and are skipped", summary.failed);
    }
}

/// Time `f()`'s future, printing the elapsed time under `label`.
async fn benchmark<T, Fut, F>(label: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f().await;
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
