//! RSS feed ingestion
//!
//! Fetches podcast feeds, discovers new episodes, and enqueues download
//! work for the pipeline. Episodes are deduplicated by feed guid when the
//! feed provides one, and by a content hash of title and audio URL when it
//! does not (or when a publisher regenerates its guids).

use chrono::{DateTime, NaiveDate, Utc};
use feed_rs::model::{Entry, Feed};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::database::{Database, Episode, EpisodeStatus, Podcast};
use crate::error::AppError;
use crate::pipeline::Pipeline;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct FeedService {
    db: Arc<Database>,
    pipeline: Arc<Pipeline>,
    client: reqwest::Client,
}

/// Outcome of one feed sync: the podcast as stored after the sync, its
/// episodes, and what this pass changed.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub podcast: Podcast,
    pub episodes: Vec<Episode>,
    pub discovered: usize,
    pub downloads_queued: usize,
    pub resumed: usize,
}

impl FeedService {
    pub fn new(db: Arc<Database>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            db,
            pipeline,
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Register a new podcast and run its first sync. Episodes published
    /// after `download_until_date` are recorded but never downloaded.
    pub async fn add_podcast(
        &self,
        feed_url: &str,
        download_until_date: Option<NaiveDate>,
    ) -> Result<SyncResult, AppError> {
        if self.db.get_podcast_by_feed_url(feed_url)?.is_some() {
            return Err(AppError::Permanent(format!(
                "Podcast already added: {}",
                feed_url
            )));
        }

        log::info!("Fetching feed {}", feed_url);
        let feed = self.fetch_feed(feed_url).await?;

        let title = feed
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_else(|| feed_url.to_string());
        let id = self.db.insert_podcast(
            feed_url,
            &title,
            feed.authors.first().map(|p| p.name.as_str()),
            feed.description.as_ref().map(|t| t.content.as_str()),
            feed.logo.as_ref().map(|i| i.uri.as_str()),
            download_until_date,
        )?;
        log::info!("Added podcast {} ({})", id, title);

        let podcast = self
            .db
            .get_podcast(id)?
            .ok_or_else(|| AppError::NotFound(format!("podcast {}", id)))?;
        self.apply_feed(&podcast, &feed).await
    }

    /// Re-fetch a podcast's feed and pick up anything new, including
    /// resumable FAILED episodes.
    pub async fn sync_podcast(&self, podcast_id: i64) -> Result<SyncResult, AppError> {
        let podcast = self
            .db
            .get_podcast(podcast_id)?
            .ok_or_else(|| AppError::NotFound(format!("podcast {}", podcast_id)))?;
        log::info!("Syncing podcast {} ({})", podcast.id, podcast.title);

        let feed = self.fetch_feed(&podcast.feed_url).await?;
        self.apply_feed(&podcast, &feed).await
    }

    async fn fetch_feed(&self, url: &str) -> Result<Feed, AppError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let message = format!("Feed fetch returned {}: {}", status, url);
            return Err(if status.is_client_error() {
                AppError::Permanent(message)
            } else {
                AppError::Transient(message)
            });
        }
        let bytes = response.bytes().await?;
        Ok(feed_rs::parser::parse(bytes.as_ref())?)
    }

    /// Reconcile one fetched feed against the database: insert unseen
    /// episodes, refresh podcast metadata, then enqueue downloads for
    /// DISCOVERED episodes inside the download window and resume FAILED
    /// ones.
    async fn apply_feed(&self, podcast: &Podcast, feed: &Feed) -> Result<SyncResult, AppError> {
        let mut discovered = 0;

        for entry in &feed.entries {
            let Some((audio_url, duration_seconds)) = audio_enclosure(entry) else {
                log::debug!("Skipping entry without audio enclosure: {}", entry.id);
                continue;
            };

            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let hash = content_hash(&title, &audio_url);
            let guid = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };

            let mut existing = None;
            if let Some(guid) = guid {
                existing = self.db.find_episode_by_guid(podcast.id, guid)?;
            }
            if existing.is_none() {
                existing = self.db.find_episode_by_content_hash(podcast.id, &hash)?;
            }
            if existing.is_some() {
                continue;
            }

            self.db.insert_episode(
                podcast.id,
                guid,
                &hash,
                &title,
                entry.summary.as_ref().map(|t| t.content.as_str()),
                entry.published.or(entry.updated),
                duration_seconds,
                &audio_url,
            )?;
            discovered += 1;
        }

        let title = feed
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_else(|| podcast.title.clone());
        self.db.update_podcast_metadata(
            podcast.id,
            &title,
            feed.authors.first().map(|p| p.name.as_str()),
            feed.description.as_ref().map(|t| t.content.as_str()),
            feed.logo.as_ref().map(|i| i.uri.as_str()),
        )?;

        let mut downloads_queued = 0;
        let mut resumed = 0;
        for episode in self.db.episodes_for_podcast(podcast.id)? {
            match episode.status {
                EpisodeStatus::Discovered
                    if within_download_window(
                        podcast.download_until_date,
                        episode.published_date,
                    ) =>
                {
                    match self.pipeline.begin_download(episode.id) {
                        Ok(()) => downloads_queued += 1,
                        Err(AppError::DuplicateJob(msg)) => {
                            log::debug!("Skipping enqueue: {}", msg)
                        }
                        Err(e) => return Err(e),
                    }
                }
                EpisodeStatus::Failed => match self.pipeline.resume_failed(&episode).await {
                    Ok(()) => resumed += 1,
                    Err(AppError::DuplicateJob(msg)) => log::debug!("Skipping resume: {}", msg),
                    Err(e) => return Err(e),
                },
                _ => {}
            }
        }

        self.db.touch_last_synced(podcast.id)?;

        log::info!(
            "Sync of podcast {} done: {} discovered, {} downloads queued, {} resumed",
            podcast.id,
            discovered,
            downloads_queued,
            resumed
        );
        let updated = self
            .db
            .get_podcast(podcast.id)?
            .ok_or_else(|| AppError::NotFound(format!("podcast {}", podcast.id)))?;
        Ok(SyncResult {
            episodes: self.db.episodes_for_podcast(podcast.id)?,
            podcast: updated,
            discovered,
            downloads_queued,
            resumed,
        })
    }
}

/// First audio enclosure of a feed entry, with its duration when the feed
/// declares one.
fn audio_enclosure(entry: &Entry) -> Option<(String, Option<i64>)> {
    for media in &entry.media {
        let duration = media
            .duration
            .or_else(|| media.content.iter().find_map(|c| c.duration));
        for content in &media.content {
            let is_audio = content
                .content_type
                .as_ref()
                .map(|m| m.essence().to_string().starts_with("audio/"))
                .unwrap_or(true);
            if !is_audio {
                continue;
            }
            if let Some(url) = &content.url {
                return Some((url.to_string(), duration.map(|d| d.as_secs() as i64)));
            }
        }
    }
    None
}

/// Stable identity for an episode when the feed has no usable guid.
fn content_hash(title: &str, audio_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(audio_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// An episode is downloadable when the podcast has no cutoff, or when it
/// was published on or before the cutoff date. Episodes without a publish
/// date are held back whenever a cutoff is set.
fn within_download_window(
    download_until_date: Option<NaiveDate>,
    published: Option<DateTime<Utc>>,
) -> bool {
    match (download_until_date, published) {
        (None, _) => true,
        (Some(limit), Some(published)) => published.date_naive() <= limit,
        (Some(_), None) => false,
    }
}

// =========================================================================
// Tests
// =========================================================================
