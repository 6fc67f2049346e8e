use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serp_ranker::aggregate::DomainAggregator;
use serp_ranker::cache::ResponseCache;
use serp_ranker::config::{AppConfig, ConfigLoader};
use serp_ranker::input::parse_input;
use serp_ranker::metrics::{MetricsCollector, MetricsSnapshot};
use serp_ranker::model::UrlEntry;
use serp_ranker::output::create_handler;
use serp_ranker::pipeline::{IngestEvent, IngestPipeline, RunSummary};
use serp_ranker::proxy::ProxyFetcher;
use serp_ranker::repository::{ResultStore, SqliteStore};
use serp_ranker::scheduler::Scheduler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "serp-ranker")]
#[command(version = "0.1.0")]
#[command(about = "Fetch search result pages through proxies and rank domains by estimated traffic", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and store every URL listed in an input file
    Ingest {
        /// Path to the configuration file (JSON/YAML/TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Input file: one URL per line, optionally followed by a tab and a search volume
        #[arg(short, long)]
        input: PathBuf,

        /// Owner to store results under (defaults to the config's owner_id)
        #[arg(long)]
        owner: Option<String>,

        /// Show progress bars (stderr)
        #[arg(short, long, default_value_t = false)]
        progress: bool,

        /// Write the domain report once the run finishes
        #[arg(long, default_value_t = false)]
        analyze: bool,
    },
    /// Fetch a single URL again and store the outcome
    Retry {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        url: String,

        #[arg(long, default_value_t = 0)]
        volume: u64,

        #[arg(long)]
        owner: Option<String>,
    },
    /// Aggregate stored results into the domain report
    Analyze {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        owner: Option<String>,
    },
    /// Validate a configuration file
    Check {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    let cli = Cli::parse();
    let logger = env_logger::Builder::from_default_env().build();
    let multi = Arc::new(MultiProgress::new());

    let with_bars = matches!(cli.command, Commands::Ingest { progress: true, .. });
    if with_bars {
        indicatif_log_bridge::LogWrapper::new((*multi).clone(), logger).try_init()?;
    } else {
        let level = logger.filter();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
    }

    match cli.command {
        Commands::Ingest {
            config,
            input,
            owner,
            progress,
            analyze,
        } => {
            let config = load_config(&config)?;
            let owner = owner.unwrap_or_else(|| config.owner_id.clone());

            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let entries = match parse_input(&text) {
                Ok(entries) => entries,
                Err(errors) => {
                    eprintln!("❌ Input has {} malformed line(s):", errors.lines().len());
                    for error in errors.lines() {
                        eprintln!("   {}", error);
                    }
                    std::process::exit(1);
                }
            };
            log::info!("Loaded {} URLs from {}", entries.len(), input.display());

            let store = open_store(&config).await?;
            let pipeline = build_pipeline(&config, store.clone())?;
            let bars = progress.then(|| multi.clone());
            let summary = run_ingest(&pipeline, entries, &owner, bars).await?;

            let final_metrics = pipeline.get_metrics();
            println!("\n✅ Ingest {}:", if summary.cancelled { "Cancelled" } else { "Completed" });
            println!("   URLs: {}", summary.total);
            println!("   Reused: {} ({} volume updates)", summary.kept, summary.volume_updated);
            println!("   Fetched: {} ({} failed)", summary.fetched, summary.fetch_failed);
            println!("   Save Errors: {}", summary.persist_errors);
            println!("   Cache Hits: {}", final_metrics.cache_hits);
            println!("   Average Duration: {}ms", final_metrics.avg_response_time_ms);
            println!("   Total Time: {:.1}s", final_metrics.elapsed_seconds);

            if analyze && !summary.cancelled {
                write_report(store.as_ref(), &config, &owner, Some(multi.clone())).await?;
            }
        }
        Commands::Retry {
            config,
            url,
            volume,
            owner,
        } => {
            let config = load_config(&config)?;
            let owner = owner.unwrap_or_else(|| config.owner_id.clone());
            let store = open_store(&config).await?;
            let pipeline = build_pipeline(&config, store)?;

            let stored = pipeline.retry(&UrlEntry::new(url, volume), &owner).await?;
            if stored.success {
                println!("✅ {} fetched (HTTP {})", stored.url, stored.http_status);
            } else {
                println!(
                    "❌ {} failed: {}",
                    stored.url,
                    stored.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Analyze { config, owner } => {
            let config = load_config(&config)?;
            let owner = owner.unwrap_or_else(|| config.owner_id.clone());
            let store = open_store(&config).await?;
            write_report(store.as_ref(), &config, &owner, None).await?;
        }
        Commands::Check { config } => match ConfigLoader::load(&config) {
            Ok(cfg) => {
                println!("✅ Config is valid:");
                println!("   Owner: {}", cfg.owner_id);
                println!("   Database: {}", cfg.database.path);
                println!(
                    "   Proxies: {}",
                    cfg.effective_proxies()
                        .iter()
                        .map(|p| p.name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
                println!(
                    "   Batches: {} URLs, scheduler {}..{} tasks",
                    cfg.pipeline.batch_size,
                    cfg.scheduler.min_batch_size,
                    cfg.scheduler.max_batch_size
                );
            }
            Err(e) => {
                eprintln!("❌ Config error: {}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    log::info!("Loading config from {:?}", path);
    ConfigLoader::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(Path::new(&config.database.path))
        .await?
        .with_chunk_size(config.pipeline.lookup_chunk_size);
    Ok(Arc::new(store))
}

fn build_pipeline(config: &AppConfig, store: Arc<SqliteStore>) -> anyhow::Result<IngestPipeline> {
    let metrics = Arc::new(MetricsCollector::new());
    let cache = Arc::new(ResponseCache::new(
        Duration::from_secs(config.cache.ttl_secs),
        config.cache.capacity,
    ));
    let scheduler = Scheduler::new(config.scheduler.clone());
    let fetcher = ProxyFetcher::new(
        config.effective_proxies(),
        &config.fetch,
        cache,
        scheduler,
        metrics.clone(),
    )?;

    Ok(
        IngestPipeline::new(store, Arc::new(fetcher), Some(metrics))
            .with_batch_size(config.pipeline.batch_size),
    )
}

async fn run_ingest(
    pipeline: &IngestPipeline,
    entries: Vec<UrlEntry>,
    owner: &str,
    multi: Option<Arc<MultiProgress>>,
) -> anyhow::Result<RunSummary> {
    let mut progress_bar: Option<ProgressBar> = None;
    let mut progress_task = None;
    if let Some(multi) = &multi {
        let pb = multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );

        let mut metrics_rx = pipeline.watch_metrics();
        let pb_clone = pb.clone();
        progress_bar = Some(pb);
        progress_task = Some(tokio::spawn(async move {
            while metrics_rx.changed().await.is_ok() {
                let snapshot: MetricsSnapshot = metrics_rx.borrow().clone();
                pb_clone.set_length(snapshot.urls_queued);
                pb_clone.set_position(snapshot.urls_processed + snapshot.urls_reused);
                pb_clone.set_message(format!(
                    "Stored: {} | Success: {:.1}% | RPS: {:.2}",
                    snapshot.results_stored, snapshot.success_rate, snapshot.requests_per_second
                ));
            }
        }));
    }

    log::info!("Starting ingest for {}...", owner);
    let mut events = pipeline.run(entries, owner).await;
    let mut summary = RunSummary::default();
    let mut cancelling = false;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(IngestEvent::State(state)) => log::debug!("Run state: {:?}", state),
                Some(IngestEvent::PersistFailed { url, error }) => {
                    log::warn!("Result for {} was not saved: {}", url, error)
                }
                Some(IngestEvent::Finished(done)) => summary = done,
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                log::warn!("Interrupted, cancelling run...");
                pipeline.reset(owner).await;
                cancelling = true;
            }
        }
    }

    if let Some(task) = progress_task {
        task.abort();
    }
    if let Some(pb) = progress_bar {
        let final_metrics = pipeline.get_metrics();
        pb.set_style(
            ProgressStyle::default_bar()
                .template("✅ [{elapsed_precise}] [{bar:40.green/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.finish_with_message(format!(
            "Stored: {} | Success: {:.1}% | RPS: {:.2} - {}",
            final_metrics.results_stored,
            final_metrics.success_rate,
            final_metrics.requests_per_second,
            if summary.cancelled { "Cancelled" } else { "Completed" }
        ));
    }

    Ok(summary)
}

async fn write_report(
    store: &dyn ResultStore,
    config: &AppConfig,
    owner: &str,
    multi: Option<Arc<MultiProgress>>,
) -> anyhow::Result<()> {
    let results = store.list_current(owner).await?;
    log::info!("Aggregating {} stored results for {}", results.len(), owner);

    let task = DomainAggregator::new().spawn(results);
    let mut progress = task.progress.clone();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            log::debug!("Aggregation {}% done", *progress.borrow());
        }
    });
    let stats = task.join().await?;
    reporter.abort();

    let mut output = create_handler(config.output.as_ref(), multi)?;
    for domain in &stats {
        output.write(domain).await?;
    }
    output.close().await?;

    log::info!("Report written for {} domains", stats.len());
    Ok(())
}
