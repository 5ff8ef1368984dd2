use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use podcast_indexer::config::Config;
use podcast_indexer::database::Database;
use podcast_indexer::feed::FeedService;
use podcast_indexer::ollama::OllamaClient;
use podcast_indexer::pipeline::Pipeline;
use podcast_indexer::qa::QaEngine;
use podcast_indexer::queue::JobQueue;
use podcast_indexer::status::StatusReporter;
use podcast_indexer::whisper::WhisperClient;
use podcast_indexer::worker::{WorkerContext, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Podcast ingestion, transcription, and question answering daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subscribe to a feed URL before entering the sync loop
    #[arg(long)]
    add_feed: Option<String>,

    /// With --add-feed: only download episodes published on or before this date (YYYY-MM-DD)
    #[arg(long)]
    download_until: Option<NaiveDate>,

    /// Answer a question against an indexed podcast and exit
    #[arg(long)]
    ask: Option<String>,

    /// Podcast id for --ask (defaults to the first podcast)
    #[arg(long)]
    podcast: Option<i64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config =
        Arc::new(Config::load(args.config.as_deref()).context("Failed to load configuration")?);

    std::fs::create_dir_all(config.data_dir()).with_context(|| {
        format!(
            "Failed to create data directory: {}",
            config.data_dir().display()
        )
    })?;
    let db = Arc::new(Database::new(&config.db_path()).context("Failed to open database")?);

    // One-shot question answering, no daemon startup
    if let Some(question) = args.ask {
        return ask(&db, &config, args.podcast, &question).await;
    }

    log::info!("Podcast indexer starting");
    log::info!("  Data dir: {}", config.data_dir().display());
    log::info!("  Whisper: {}", config.whisper.url);
    log::info!(
        "  Ollama: {} (embed {}, chat {})",
        config.ollama.url,
        config.ollama.embedding_model,
        config.ollama.chat_model
    );

    let cancel = CancellationToken::new();
    let queue = Arc::new(JobQueue::new(cancel.clone()));
    let pipeline = Arc::new(Pipeline::new(db.clone(), queue.clone(), config.clone()));
    let feeds = FeedService::new(db.clone(), pipeline.clone());

    let whisper = Arc::new(WhisperClient::new(&config.whisper.url));
    let ollama = Arc::new(OllamaClient::new(
        &config.ollama.url,
        &config.ollama.embedding_model,
        &config.ollama.chat_model,
    ));
    if let Err(e) = whisper.health_check().await {
        log::warn!("Whisper service unreachable, transcription will fail until it is up: {}", e);
    }
    match ollama.health_check().await {
        Ok(status) => {
            if !status.embedding_model_available {
                log::warn!(
                    "Embedding model {} not present in Ollama",
                    config.ollama.embedding_model
                );
            }
            if !status.chat_model_available {
                log::warn!("Chat model {} not present in Ollama", config.ollama.chat_model);
            }
        }
        Err(e) => {
            log::warn!("Ollama unreachable, indexing and answers will fail until it is up: {}", e)
        }
    }

    if let Some(feed_url) = &args.add_feed {
        match feeds.add_podcast(feed_url, args.download_until).await {
            Ok(result) => log::info!(
                "Subscribed {}: {} episodes discovered, {} downloads queued",
                result.podcast.title,
                result.discovered,
                result.downloads_queued
            ),
            Err(e) => log::error!("Failed to add {}: {}", feed_url, e),
        }
    }

    // Requeue work interrupted by the previous shutdown
    pipeline.recover().await.context("Startup recovery failed")?;

    let pool = WorkerPool::new(WorkerContext {
        db: db.clone(),
        queue: queue.clone(),
        pipeline: pipeline.clone(),
        whisper,
        ollama,
        config: config.clone(),
    });
    let reporter = StatusReporter::new(queue.clone(), pool.parallelism());
    let handles = pool.spawn(cancel.clone());

    // First tick fires immediately, so feeds are synced right at startup
    let mut sync_timer =
        tokio::time::interval(Duration::from_secs(config.sync.interval_minutes.max(1) * 60));
    let mut status_timer = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutdown requested");
                break;
            }
            _ = sync_timer.tick() => {
                sync_all(&db, &feeds).await;
            }
            _ = status_timer.tick() => {
                let status = reporter.get_status(config.jobs.queue.status_limit);
                if status.active_job_count > 0 || status.queue_size > 0 {
                    log::info!(
                        "Queue: {} active, {} queued",
                        status.active_job_count,
                        status.queue_size
                    );
                }
            }
        }
    }

    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    log::info!("Shutdown complete");
    Ok(())
}

async fn sync_all(db: &Arc<Database>, feeds: &FeedService) {
    let podcasts = match db.list_podcasts() {
        Ok(podcasts) => podcasts,
        Err(e) => {
            log::error!("Failed to list podcasts: {}", e);
            return;
        }
    };
    if podcasts.is_empty() {
        log::info!("No podcasts subscribed yet, nothing to sync");
        return;
    }

    for podcast in podcasts {
        match feeds.sync_podcast(podcast.id).await {
            Ok(result) => log::info!(
                "Synced {}: {} new, {} downloads queued, {} resumed",
                podcast.title,
                result.discovered,
                result.downloads_queued,
                result.resumed
            ),
            Err(e) => log::error!("Sync failed for {}: {}", podcast.title, e),
        }
    }
}

async fn ask(
    db: &Arc<Database>,
    config: &Arc<Config>,
    podcast: Option<i64>,
    question: &str,
) -> Result<()> {
    let podcast_id = match podcast {
        Some(id) => id,
        None => db
            .list_podcasts()?
            .first()
            .map(|p| p.id)
            .context("No podcasts in the database; add one with --add-feed")?,
    };

    let ollama = Arc::new(OllamaClient::new(
        &config.ollama.url,
        &config.ollama.embedding_model,
        &config.ollama.chat_model,
    ));
    let engine = QaEngine::new(db.clone(), ollama, config.search.top_k);
    let answer = engine.answer(podcast_id, question).await?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
