//! In-memory durable-ordering job queue shared by the feed sync and the
//! worker pool. One job per (resource, type, part) may be queued or active
//! at a time; a second enqueue is rejected as a duplicate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Download,
    Transcribe,
    Index,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Download => write!(f, "DOWNLOAD"),
            JobType::Transcribe => write!(f, "TRANSCRIBE"),
            JobType::Index => write!(f, "INDEX"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub resource_id: i64,
    pub part_index: Option<u32>,
    pub audio_file_path: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl Job {
    pub fn new(job_type: JobType, resource_id: i64) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type,
            resource_id,
            part_index: None,
            audio_file_path: None,
            enqueued_at: Utc::now(),
            started_at: None,
            attempt: 1,
        }
    }

    pub fn for_part(
        job_type: JobType,
        resource_id: i64,
        part_index: u32,
        audio_file_path: &str,
    ) -> Self {
        Self {
            part_index: Some(part_index),
            audio_file_path: Some(audio_file_path.to_string()),
            ..Self::new(job_type, resource_id)
        }
    }

    fn key(&self) -> JobKey {
        (self.resource_id, self.job_type, self.part_index)
    }
}

/// Exclusivity key: one live job per resource, type, and part.
type JobKey = (i64, JobType, Option<u32>);

#[derive(Debug, Default)]
struct QueueState {
    queued: VecDeque<Job>,
    active: HashMap<Uuid, Job>,
    in_flight: HashSet<JobKey>,
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub active: Vec<Job>,
    pub queued_preview: Vec<Job>,
    pub queue_size: usize,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl JobQueue {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel,
        }
    }

    /// Add a job to the back of the queue. Fails with DuplicateJob when a
    /// job with the same exclusivity key is already queued or active.
    pub fn enqueue(&self, job: Job) -> Result<(), AppError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.in_flight.insert(job.key()) {
                let part = match job.part_index {
                    Some(p) => format!(" part {}", p),
                    None => String::new(),
                };
                return Err(AppError::DuplicateJob(format!(
                    "{} job for resource {}{} is already queued or active",
                    job.job_type, job.resource_id, part
                )));
            }
            state.queued.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest queued job, marking it active. Waits when the queue
    /// is empty. Returns None once the queue is cancelled, including when
    /// jobs are still queued, so workers drain instead of starting new work.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            // Register for notifications before checking the queue, so an
            // enqueue that lands between the check and the await still
            // wakes this waiter.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if let Some(mut job) = state.queued.pop_front() {
                    job.started_at = Some(Utc::now());
                    state.active.insert(job.job_id, job.clone());
                    return Some(job);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Remove a finished job and release its exclusivity key. Returns None
    /// for unknown ids, so duplicate completions are harmless.
    pub fn complete(&self, job_id: Uuid) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        let job = state.active.remove(&job_id)?;
        state.in_flight.remove(&job.key());
        Some(job)
    }

    /// Remove a failed job and release its exclusivity key, allowing a
    /// retry to be enqueued. Returns None for unknown ids.
    pub fn fail(&self, job_id: Uuid, reason: &str) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        let job = state.active.remove(&job_id)?;
        state.in_flight.remove(&job.key());
        log::warn!(
            "Job {} ({} for resource {}) failed: {}",
            job.job_id,
            job.job_type,
            job.resource_id,
            reason
        );
        Some(job)
    }

    /// One consistent view of the queue: every active job, the total queued
    /// count, and at most `limit` queued jobs in queue order.
    pub fn snapshot(&self, limit: usize) -> QueueSnapshot {
        let state = self.state.lock().unwrap();
        let mut active: Vec<Job> = state.active.values().cloned().collect();
        active.sort_by_key(|job| job.started_at);
        QueueSnapshot {
            queue_size: state.queued.len(),
            queued_preview: state.queued.iter().take(limit).cloned().collect(),
            active,
        }
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dequeue_follows_enqueue_order() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.enqueue(Job::new(JobType::Download, 1)).unwrap();
        queue.enqueue(Job::new(JobType::Download, 2)).unwrap();
        queue.enqueue(Job::new(JobType::Download, 3)).unwrap();

        assert_eq!(queue.dequeue().await.unwrap().resource_id, 1);
        assert_eq!(queue.dequeue().await.unwrap().resource_id, 2);
        assert_eq!(queue.dequeue().await.unwrap().resource_id, 3);
    }

    #[test]
    fn test_duplicate_rejected_while_queued() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.enqueue(Job::new(JobType::Download, 7)).unwrap();

        let err = queue.enqueue(Job::new(JobType::Download, 7)).unwrap_err();
        assert!(matches!(err, AppError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_while_active() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.enqueue(Job::new(JobType::Transcribe, 7)).unwrap();
        let active = queue.dequeue().await.unwrap();

        let err = queue
            .enqueue(Job::new(JobType::Transcribe, 7))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateJob(_)));

        // Completion releases the key, so a fresh job is accepted again
        queue.complete(active.job_id).unwrap();
        queue.enqueue(Job::new(JobType::Transcribe, 7)).unwrap();
    }

    #[test]
    fn test_same_episode_different_parts_coexist() {
        let queue = JobQueue::new(CancellationToken::new());
        queue
            .enqueue(Job::for_part(JobType::Transcribe, 7, 0, "ep7_part0.mp3"))
            .unwrap();
        queue
            .enqueue(Job::for_part(JobType::Transcribe, 7, 1, "ep7_part1.mp3"))
            .unwrap();

        let err = queue
            .enqueue(Job::for_part(JobType::Transcribe, 7, 1, "ep7_part1.mp3"))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.enqueue(Job::new(JobType::Index, 4)).unwrap();
        let job = queue.dequeue().await.unwrap();

        assert!(queue.complete(job.job_id).is_some());
        assert!(queue.complete(job.job_id).is_none());
    }

    #[tokio::test]
    async fn test_fail_releases_key_for_retry() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.enqueue(Job::new(JobType::Download, 9)).unwrap();
        let job = queue.dequeue().await.unwrap();

        queue.fail(job.job_id, "connection reset").unwrap();

        let mut retry = job.clone();
        retry.attempt += 1;
        retry.started_at = None;
        queue.enqueue(retry).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reports_full_size_with_limited_preview() {
        let queue = JobQueue::new(CancellationToken::new());
        for id in 1..=15 {
            queue.enqueue(Job::new(JobType::Download, id)).unwrap();
        }
        for _ in 0..3 {
            queue.dequeue().await.unwrap();
        }

        let snapshot = queue.snapshot(5);
        assert_eq!(snapshot.active.len(), 3);
        assert_eq!(snapshot.queue_size, 12);
        assert_eq!(snapshot.queued_preview.len(), 5);
        let previewed: Vec<i64> = snapshot
            .queued_preview
            .iter()
            .map(|j| j.resource_id)
            .collect();
        assert_eq!(previewed, vec![4, 5, 6, 7, 8]);
        assert!(snapshot.active.iter().all(|j| j.started_at.is_some()));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_new_work() {
        let queue = Arc::new(JobQueue::new(CancellationToken::new()));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(Job::new(JobType::Download, 42)).unwrap();
        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.resource_id, 42);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn test_two_waiters_both_receive_jobs() {
        let queue = Arc::new(JobQueue::new(CancellationToken::new()));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(Job::new(JobType::Download, 1)).unwrap();
        queue.enqueue(Job::new(JobType::Download, 2)).unwrap();

        let mut ids = vec![
            first.await.unwrap().unwrap().resource_id,
            second.await.unwrap().unwrap().resource_id,
        ];
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_queue_wakes_blocked_waiters() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(JobQueue::new(cancel.clone()));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_queue_stops_handing_out_queued_jobs() {
        let cancel = CancellationToken::new();
        let queue = JobQueue::new(cancel.clone());
        queue.enqueue(Job::new(JobType::Index, 1)).unwrap();

        cancel.cancel();
        assert!(queue.dequeue().await.is_none());
    }
}
