//! Job worker status reporting
//!
//! Serializable snapshot of the queue for operators: configured
//! parallelism, every active job, and a bounded preview of the queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::queue::{Job, JobQueue, JobType};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWorkerStatus {
    pub parallelism: usize,
    pub active_job_count: usize,
    pub queue_size: usize,
    pub last_updated: DateTime<Utc>,
    pub active_jobs: Vec<JobStatusEntry>,
    pub queued_jobs: Vec<JobStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEntry {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub resource_id: i64,
    pub part_index: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub audio_file_path: Option<String>,
}

impl From<&Job> for JobStatusEntry {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            resource_id: job.resource_id,
            part_index: job.part_index,
            started_at: job.started_at,
            audio_file_path: job.audio_file_path.clone(),
        }
    }
}

pub struct StatusReporter {
    queue: Arc<JobQueue>,
    parallelism: usize,
}

impl StatusReporter {
    pub fn new(queue: Arc<JobQueue>, parallelism: usize) -> Self {
        Self { queue, parallelism }
    }

    /// One consistent status view. Counts and previews come from a single
    /// queue snapshot, so they can never disagree with each other.
    pub fn get_status(&self, preview_limit: usize) -> JobWorkerStatus {
        let snapshot = self.queue.snapshot(preview_limit);
        JobWorkerStatus {
            parallelism: self.parallelism,
            active_job_count: snapshot.active.len(),
            queue_size: snapshot.queue_size,
            last_updated: Utc::now(),
            active_jobs: snapshot.active.iter().map(JobStatusEntry::from).collect(),
            queued_jobs: snapshot
                .queued_preview
                .iter()
                .map(JobStatusEntry::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_counts_and_previews_come_from_one_snapshot() {
        let queue = Arc::new(JobQueue::new(CancellationToken::new()));
        let reporter = StatusReporter::new(queue.clone(), 3);
        for id in 1..=15 {
            queue.enqueue(Job::new(JobType::Download, id)).unwrap();
        }
        for _ in 0..3 {
            queue.dequeue().await.unwrap();
        }

        let status = reporter.get_status(5);
        assert_eq!(status.parallelism, 3);
        assert_eq!(status.active_job_count, 3);
        assert_eq!(status.queue_size, 12);
        assert_eq!(status.active_jobs.len(), 3);
        assert_eq!(status.queued_jobs.len(), 5);
        assert!(status.active_jobs.iter().all(|j| j.started_at.is_some()));
        assert!(status.queued_jobs.iter().all(|j| j.started_at.is_none()));
    }

    #[tokio::test]
    async fn test_wire_format_field_names() {
        let queue = Arc::new(JobQueue::new(CancellationToken::new()));
        let reporter = StatusReporter::new(queue.clone(), 1);
        queue
            .enqueue(Job::for_part(
                JobType::Transcribe,
                7,
                1,
                "/data/audio/7_part1.mp3",
            ))
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.enqueue(Job::new(JobType::Download, 8)).unwrap();

        let status = reporter.get_status(10);
        let value = serde_json::to_value(&status).unwrap();

        let object = value.as_object().unwrap();
        for key in [
            "parallelism",
            "activeJobCount",
            "queueSize",
            "lastUpdated",
            "activeJobs",
            "queuedJobs",
        ] {
            assert!(object.contains_key(key), "missing key {}", key);
        }

        let active = &value["activeJobs"][0];
        assert_eq!(active["type"], "TRANSCRIBE");
        assert_eq!(active["resourceId"], 7);
        assert_eq!(active["partIndex"], 1);
        assert_eq!(active["audioFilePath"], "/data/audio/7_part1.mp3");
        assert!(active["startedAt"].is_string());
        assert!(active["jobId"].is_string());

        let queued = &value["queuedJobs"][0];
        assert_eq!(queued["type"], "DOWNLOAD");
        assert!(queued["partIndex"].is_null());
        assert!(queued["startedAt"].is_null());
        assert!(queued["audioFilePath"].is_null());
    }
}
