//! Episode lifecycle coordinator. Owns the status transitions between
//! DISCOVERED and INDEXED, the per-episode transcription part counters,
//! and the job enqueues that drive each stage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::database::{Database, Episode, EpisodeStatus, NewChunk, NewSegment};
use crate::error::AppError;
use crate::queue::{Job, JobQueue, JobType};
use crate::worker::audio::{self, PartPlan};

/// Completion flags for an episode's transcription parts. TRANSCRIBED is
/// entered when every flag is set, so no job-table scan is ever needed.
struct PartProgress {
    done: Vec<bool>,
}

pub struct Pipeline {
    db: Arc<Database>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
    parts: Mutex<HashMap<i64, PartProgress>>,
}

impl Pipeline {
    pub fn new(db: Arc<Database>, queue: Arc<JobQueue>, config: Arc<Config>) -> Self {
        Self {
            db,
            queue,
            config,
            parts: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue the DOWNLOAD job for an episode and mark it DOWNLOADING.
    /// The extra source states let recovery restart a download whose audio
    /// file disappeared.
    pub fn begin_download(&self, episode_id: i64) -> Result<(), AppError> {
        self.queue.enqueue(Job::new(JobType::Download, episode_id))?;
        self.mark_status(
            episode_id,
            &[
                EpisodeStatus::Discovered,
                EpisodeStatus::Failed,
                EpisodeStatus::Downloaded,
                EpisodeStatus::Transcribing,
            ],
            EpisodeStatus::Downloading,
        )?;
        Ok(())
    }

    /// Record a finished download. Returns false when the episode was not
    /// DOWNLOADING, which makes duplicate completions no-ops.
    pub fn finish_download(
        &self,
        episode_id: i64,
        audio_file_path: &str,
        duration_seconds: i64,
    ) -> Result<bool, AppError> {
        if !self.db.try_transition_status(
            episode_id,
            EpisodeStatus::Downloading,
            EpisodeStatus::Downloaded,
        )? {
            log::debug!(
                "Ignoring download completion for episode {} outside DOWNLOADING",
                episode_id
            );
            return Ok(false);
        }
        self.db
            .set_episode_downloaded(episode_id, audio_file_path, duration_seconds)?;
        Ok(true)
    }

    /// Enqueue one TRANSCRIBE job per audio part and mark the episode
    /// TRANSCRIBING.
    pub fn begin_transcription(
        &self,
        episode_id: i64,
        parts: &[PartPlan],
    ) -> Result<(), AppError> {
        self.db.set_episode_part_count(episode_id, parts.len() as u32)?;
        {
            let mut tracker = self.parts.lock().unwrap();
            tracker.insert(
                episode_id,
                PartProgress {
                    done: vec![false; parts.len()],
                },
            );
        }

        for part in parts {
            self.enqueue_part(episode_id, part)?;
        }

        self.mark_status(
            episode_id,
            &[EpisodeStatus::Downloaded, EpisodeStatus::Failed],
            EpisodeStatus::Transcribing,
        )?;
        Ok(())
    }

    /// Store the segments for one finished part and flip the done flag.
    /// When the last flag flips, the episode becomes TRANSCRIBED and its
    /// INDEX job is enqueued.
    pub fn finish_transcribe_part(
        &self,
        episode_id: i64,
        part_index: u32,
        segments: &[NewSegment],
    ) -> Result<(), AppError> {
        {
            let tracker = self.parts.lock().unwrap();
            match tracker.get(&episode_id) {
                Some(progress)
                    if progress.done.get(part_index as usize).copied() == Some(true) =>
                {
                    log::debug!(
                        "Ignoring duplicate completion for episode {} part {}",
                        episode_id,
                        part_index
                    );
                    return Ok(());
                }
                None => {
                    log::debug!(
                        "Ignoring part completion for episode {} with no tracked parts",
                        episode_id
                    );
                    return Ok(());
                }
                _ => {}
            }
        }

        self.db.append_segments(episode_id, part_index, segments)?;

        let all_done = {
            let mut tracker = self.parts.lock().unwrap();
            match tracker.get_mut(&episode_id) {
                Some(progress) => {
                    if let Some(flag) = progress.done.get_mut(part_index as usize) {
                        *flag = true;
                    }
                    progress.done.iter().all(|d| *d)
                }
                None => return Ok(()),
            }
        };

        if all_done {
            self.parts.lock().unwrap().remove(&episode_id);
            if self.mark_status(
                episode_id,
                &[EpisodeStatus::Transcribing],
                EpisodeStatus::Transcribed,
            )? {
                log::info!("Episode {} fully transcribed", episode_id);
                self.begin_indexing(episode_id)?;
            }
        }
        Ok(())
    }

    /// Enqueue the INDEX job for a fully transcribed episode.
    pub fn begin_indexing(&self, episode_id: i64) -> Result<(), AppError> {
        self.queue.enqueue(Job::new(JobType::Index, episode_id))?;
        self.mark_status(
            episode_id,
            &[EpisodeStatus::Transcribed, EpisodeStatus::Failed],
            EpisodeStatus::Indexing,
        )?;
        Ok(())
    }

    /// Store the search chunks and finalize to INDEXED in one step.
    /// Returns false for duplicate completions.
    pub fn finish_index(&self, episode_id: i64, chunks: &[NewChunk]) -> Result<bool, AppError> {
        let finalized = self.db.insert_chunks_and_finalize(episode_id, chunks)?;
        if finalized {
            log::info!("Episode {} indexed ({} chunks)", episode_id, chunks.len());
        } else {
            log::debug!("Ignoring index completion for episode {} outside INDEXING", episode_id);
        }
        Ok(finalized)
    }

    /// Mark an episode FAILED after a permanent stage failure. Part
    /// counters are kept so late sibling completions still store their
    /// segments for a later resume.
    pub fn fail_episode(&self, episode_id: i64, reason: &str) -> Result<(), AppError> {
        if self.db.fail_episode(episode_id, reason)? {
            log::error!("Episode {} failed: {}", episode_id, reason);
        }
        Ok(())
    }

    /// Re-drive a FAILED episode from the last stage whose output is still
    /// durable: transcription when the audio file survives, otherwise a
    /// fresh download.
    pub async fn resume_failed(&self, episode: &Episode) -> Result<(), AppError> {
        let audio_path = episode.audio_file_path.as_deref().filter(|p| Path::new(p).exists());

        match (audio_path, episode.duration_seconds) {
            (Some(path), Some(duration)) => {
                log::info!(
                    "Resuming failed episode {} from transcription",
                    episode.id
                );
                self.resume_transcription(episode.id, path, duration).await
            }
            _ => {
                log::info!("Resuming failed episode {} from download", episode.id);
                self.begin_download(episode.id)
            }
        }
    }

    /// Requeue work for episodes interrupted mid-stage by a shutdown or
    /// crash. Runs at startup, before any worker is spawned.
    pub async fn recover(&self) -> Result<(), AppError> {
        for episode in self.db.episodes_with_status(EpisodeStatus::Downloading)? {
            log::info!("Recovering interrupted download for episode {}", episode.id);
            self.begin_download(episode.id)?;
        }

        let mid_transcription = self
            .db
            .episodes_with_status(EpisodeStatus::Downloaded)?
            .into_iter()
            .chain(self.db.episodes_with_status(EpisodeStatus::Transcribing)?);
        for episode in mid_transcription {
            let audio_path = episode.audio_file_path.as_deref().filter(|p| Path::new(p).exists());
            match (audio_path, episode.duration_seconds) {
                (Some(path), Some(duration)) => {
                    log::info!(
                        "Recovering interrupted transcription for episode {}",
                        episode.id
                    );
                    self.resume_transcription(episode.id, path, duration).await?;
                }
                _ => {
                    log::info!(
                        "Audio for episode {} is missing; downloading again",
                        episode.id
                    );
                    self.begin_download(episode.id)?;
                }
            }
        }

        let mid_indexing = self
            .db
            .episodes_with_status(EpisodeStatus::Transcribed)?
            .into_iter()
            .chain(self.db.episodes_with_status(EpisodeStatus::Indexing)?);
        for episode in mid_indexing {
            log::info!("Recovering interrupted indexing for episode {}", episode.id);
            self.begin_indexing(episode.id)?;
        }

        Ok(())
    }

    /// Restart transcription, enqueueing only the parts that have no
    /// stored segments yet.
    async fn resume_transcription(
        &self,
        episode_id: i64,
        audio_path: &str,
        duration_seconds: i64,
    ) -> Result<(), AppError> {
        let parts = audio::plan_parts(
            Path::new(audio_path),
            duration_seconds as f64,
            self.config.split_seconds(),
        )
        .await?;

        let mut done = vec![false; parts.len()];
        for part_index in self.db.parts_with_segments(episode_id)? {
            if let Some(flag) = done.get_mut(part_index as usize) {
                *flag = true;
            }
        }

        if done.iter().all(|d| *d) {
            self.mark_status(
                episode_id,
                &[
                    EpisodeStatus::Transcribing,
                    EpisodeStatus::Downloaded,
                    EpisodeStatus::Failed,
                ],
                EpisodeStatus::Transcribed,
            )?;
            return self.begin_indexing(episode_id);
        }

        self.db.set_episode_part_count(episode_id, parts.len() as u32)?;
        {
            let mut tracker = self.parts.lock().unwrap();
            tracker.insert(episode_id, PartProgress { done: done.clone() });
        }

        for part in &parts {
            if done[part.part_index as usize] {
                continue;
            }
            self.enqueue_part(episode_id, part)?;
        }

        self.mark_status(
            episode_id,
            &[EpisodeStatus::Downloaded, EpisodeStatus::Failed],
            EpisodeStatus::Transcribing,
        )?;
        Ok(())
    }

    fn enqueue_part(&self, episode_id: i64, part: &PartPlan) -> Result<(), AppError> {
        let job = Job::for_part(
            JobType::Transcribe,
            episode_id,
            part.part_index,
            &part.audio_file_path,
        );
        match self.queue.enqueue(job) {
            Ok(()) => Ok(()),
            Err(AppError::DuplicateJob(msg)) => {
                log::debug!("Skipping enqueue: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Move an episode to `to` from the first matching source state.
    /// Returns false (without touching the row) when the episode is in
    /// none of them.
    fn mark_status(
        &self,
        episode_id: i64,
        from: &[EpisodeStatus],
        to: EpisodeStatus,
    ) -> Result<bool, AppError> {
        for &state in from {
            if self.db.try_transition_status(episode_id, state, to)? {
                return Ok(true);
            }
        }
        log::debug!(
            "Episode {} left unchanged: not in a source state for {}",
            episode_id,
            to
        );
        Ok(false)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (Pipeline, Arc<Database>, Arc<JobQueue>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let queue = Arc::new(JobQueue::new(CancellationToken::new()));
        let pipeline = Pipeline::new(db.clone(), queue.clone(), Arc::new(Config::default()));
        (pipeline, db, queue, dir)
    }

    fn insert_podcast(db: &Database) -> i64 {
        db.insert_podcast(
            "https://example.com/feed.xml",
            "Test Podcast",
            None,
            None,
            None,
            None,
        )
        .unwrap()
    }

    fn insert_episode(db: &Database, podcast_id: i64, n: u32) -> i64 {
        db.insert_episode(
            podcast_id,
            Some(&format!("guid-{}", n)),
            &format!("hash-{}", n),
            &format!("Episode {}", n),
            None,
            None,
            Some(1800),
            "https://example.com/episode.mp3",
        )
        .unwrap()
    }

    fn status_of(db: &Database, id: i64) -> EpisodeStatus {
        db.get_episode(id).unwrap().unwrap().status
    }

    fn sample_segments() -> Vec<NewSegment> {
        vec![NewSegment {
            start_ms: 0,
            end_ms: 1500,
            speaker_label: None,
            text: "welcome back to the show".to_string(),
        }]
    }

    #[tokio::test]
    async fn test_download_stage_transitions() {
        let (pipeline, db, queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);

        pipeline.begin_download(id).unwrap();
        assert_eq!(status_of(&db, id), EpisodeStatus::Downloading);
        assert_eq!(queue.dequeue().await.unwrap().job_type, JobType::Download);

        assert!(pipeline.finish_download(id, "/tmp/ep.mp3", 1800).unwrap());
        let episode = db.get_episode(id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Downloaded);
        assert_eq!(episode.audio_file_path.as_deref(), Some("/tmp/ep.mp3"));

        // A late duplicate completion changes nothing
        assert!(!pipeline.finish_download(id, "/tmp/other.mp3", 900).unwrap());
        let episode = db.get_episode(id).unwrap().unwrap();
        assert_eq!(episode.audio_file_path.as_deref(), Some("/tmp/ep.mp3"));
    }

    #[test]
    fn test_completion_before_download_started_is_rejected() {
        let (pipeline, db, _queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);

        assert!(!pipeline.finish_download(id, "/tmp/ep.mp3", 1800).unwrap());
        assert_eq!(status_of(&db, id), EpisodeStatus::Discovered);
    }

    #[tokio::test]
    async fn test_transcribed_only_after_every_part() {
        let (pipeline, db, queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        pipeline.begin_download(id).unwrap();
        pipeline.finish_download(id, "/tmp/ep.mp3", 5400).unwrap();

        let parts = vec![
            PartPlan {
                part_index: 0,
                audio_file_path: "/tmp/ep_part0.mp3".to_string(),
            },
            PartPlan {
                part_index: 1,
                audio_file_path: "/tmp/ep_part1.mp3".to_string(),
            },
        ];
        pipeline.begin_transcription(id, &parts).unwrap();
        let episode = db.get_episode(id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Transcribing);
        assert_eq!(episode.part_count, Some(2));

        // Parts may finish in any order; one done part is not enough
        pipeline
            .finish_transcribe_part(id, 1, &sample_segments())
            .unwrap();
        assert_eq!(status_of(&db, id), EpisodeStatus::Transcribing);

        pipeline
            .finish_transcribe_part(id, 0, &sample_segments())
            .unwrap();
        assert_eq!(status_of(&db, id), EpisodeStatus::Indexing);

        // Queue order: DOWNLOAD, both TRANSCRIBE parts, then INDEX
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().job_type, JobType::Index);
    }

    #[tokio::test]
    async fn test_duplicate_part_completion_keeps_first_segments() {
        let (pipeline, db, _queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        pipeline.begin_download(id).unwrap();
        pipeline.finish_download(id, "/tmp/ep.mp3", 5400).unwrap();

        let parts = vec![
            PartPlan {
                part_index: 0,
                audio_file_path: "/tmp/ep_part0.mp3".to_string(),
            },
            PartPlan {
                part_index: 1,
                audio_file_path: "/tmp/ep_part1.mp3".to_string(),
            },
        ];
        pipeline.begin_transcription(id, &parts).unwrap();
        pipeline
            .finish_transcribe_part(id, 0, &sample_segments())
            .unwrap();

        let replacement = vec![NewSegment {
            start_ms: 0,
            end_ms: 2000,
            speaker_label: None,
            text: "something else entirely".to_string(),
        }];
        pipeline.finish_transcribe_part(id, 0, &replacement).unwrap();

        let segments = db.segments_for_episode(id).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "welcome back to the show");
        assert_eq!(status_of(&db, id), EpisodeStatus::Transcribing);
    }

    #[tokio::test]
    async fn test_index_completion_finalizes_once() {
        let (pipeline, db, _queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        pipeline.begin_download(id).unwrap();
        pipeline.finish_download(id, "/tmp/ep.mp3", 600).unwrap();
        let parts = vec![PartPlan {
            part_index: 0,
            audio_file_path: "/tmp/ep.mp3".to_string(),
        }];
        pipeline.begin_transcription(id, &parts).unwrap();
        pipeline
            .finish_transcribe_part(id, 0, &sample_segments())
            .unwrap();
        assert_eq!(status_of(&db, id), EpisodeStatus::Indexing);

        let chunks = vec![NewChunk {
            chunk_index: 0,
            start_ms: 0,
            end_ms: 1500,
            text: "welcome back to the show".to_string(),
            speaker_labels: None,
            embedding: vec![0.1, 0.2, 0.3],
        }];
        assert!(pipeline.finish_index(id, &chunks).unwrap());
        assert_eq!(status_of(&db, id), EpisodeStatus::Indexed);

        assert!(!pipeline.finish_index(id, &chunks).unwrap());
        assert_eq!(db.chunks_for_podcast(podcast_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_failed_without_audio_restarts_download() {
        let (pipeline, db, queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        db.fail_episode(id, "connection refused").unwrap();

        let episode = db.get_episode(id).unwrap().unwrap();
        pipeline.resume_failed(&episode).await.unwrap();

        assert_eq!(status_of(&db, id), EpisodeStatus::Downloading);
        assert_eq!(queue.dequeue().await.unwrap().job_type, JobType::Download);
    }

    #[tokio::test]
    async fn test_resume_failed_with_audio_restarts_transcription() {
        let (pipeline, db, queue, dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        let audio = dir.path().join("episode.mp3");
        std::fs::write(&audio, b"audio bytes").unwrap();
        db.set_episode_downloaded(id, audio.to_str().unwrap(), 600)
            .unwrap();
        db.fail_episode(id, "whisper unavailable").unwrap();

        let episode = db.get_episode(id).unwrap().unwrap();
        pipeline.resume_failed(&episode).await.unwrap();

        assert_eq!(status_of(&db, id), EpisodeStatus::Transcribing);
        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.job_type, JobType::Transcribe);
        assert_eq!(job.part_index, Some(0));
    }

    #[tokio::test]
    async fn test_resume_failed_with_full_transcript_goes_to_indexing() {
        let (pipeline, db, queue, dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        let audio = dir.path().join("episode.mp3");
        std::fs::write(&audio, b"audio bytes").unwrap();
        db.set_episode_downloaded(id, audio.to_str().unwrap(), 600)
            .unwrap();
        db.append_segments(id, 0, &sample_segments()).unwrap();
        db.fail_episode(id, "ollama timed out").unwrap();

        let episode = db.get_episode(id).unwrap().unwrap();
        pipeline.resume_failed(&episode).await.unwrap();

        assert_eq!(status_of(&db, id), EpisodeStatus::Indexing);
        assert_eq!(queue.dequeue().await.unwrap().job_type, JobType::Index);
    }

    #[tokio::test]
    async fn test_recover_downloaded_with_full_transcript_goes_to_indexing() {
        let (pipeline, db, queue, dir) = setup();
        let podcast_id = insert_podcast(&db);
        let id = insert_episode(&db, podcast_id, 1);
        let audio = dir.path().join("episode.mp3");
        std::fs::write(&audio, b"audio bytes").unwrap();
        db.try_transition_status(id, EpisodeStatus::Discovered, EpisodeStatus::Downloading)
            .unwrap();
        db.set_episode_downloaded(id, audio.to_str().unwrap(), 600)
            .unwrap();
        db.try_transition_status(id, EpisodeStatus::Downloading, EpisodeStatus::Downloaded)
            .unwrap();
        // Transcript survived an earlier run that died before transcription
        // was marked complete
        db.append_segments(id, 0, &sample_segments()).unwrap();

        pipeline.recover().await.unwrap();

        assert_eq!(status_of(&db, id), EpisodeStatus::Indexing);
        assert_eq!(queue.dequeue().await.unwrap().job_type, JobType::Index);
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_stages() {
        let (pipeline, db, queue, _dir) = setup();
        let podcast_id = insert_podcast(&db);

        let mid_download = insert_episode(&db, podcast_id, 1);
        db.try_transition_status(
            mid_download,
            EpisodeStatus::Discovered,
            EpisodeStatus::Downloading,
        )
        .unwrap();

        let mid_indexing = insert_episode(&db, podcast_id, 2);
        for (from, to) in [
            (EpisodeStatus::Discovered, EpisodeStatus::Downloading),
            (EpisodeStatus::Downloading, EpisodeStatus::Downloaded),
            (EpisodeStatus::Downloaded, EpisodeStatus::Transcribing),
            (EpisodeStatus::Transcribing, EpisodeStatus::Transcribed),
            (EpisodeStatus::Transcribed, EpisodeStatus::Indexing),
        ] {
            assert!(db.try_transition_status(mid_indexing, from, to).unwrap());
        }

        pipeline.recover().await.unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.job_type, JobType::Download);
        assert_eq!(first.resource_id, mid_download);
        assert_eq!(status_of(&db, mid_download), EpisodeStatus::Downloading);

        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.job_type, JobType::Index);
        assert_eq!(second.resource_id, mid_indexing);
        assert_eq!(status_of(&db, mid_indexing), EpisodeStatus::Indexing);
    }
}
