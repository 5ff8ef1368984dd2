use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Episode processing state, stored and exposed as exact uppercase strings.
///
/// Transitions run `DISCOVERED` through `INDEXED` in order; `FAILED` is
/// reachable from any state except `INDEXED`. The strings are a wire
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeStatus {
    Discovered,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    Indexing,
    Indexed,
    Failed,
}

impl Default for EpisodeStatus {
    fn default() -> Self {
        Self::Discovered
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "DISCOVERED"),
            Self::Downloading => write!(f, "DOWNLOADING"),
            Self::Downloaded => write!(f, "DOWNLOADED"),
            Self::Transcribing => write!(f, "TRANSCRIBING"),
            Self::Transcribed => write!(f, "TRANSCRIBED"),
            Self::Indexing => write!(f, "INDEXING"),
            Self::Indexed => write!(f, "INDEXED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl From<String> for EpisodeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DISCOVERED" => Self::Discovered,
            "DOWNLOADING" => Self::Downloading,
            "DOWNLOADED" => Self::Downloaded,
            "TRANSCRIBING" => Self::Transcribing,
            "TRANSCRIBED" => Self::Transcribed,
            "INDEXING" => Self::Indexing,
            "INDEXED" => Self::Indexed,
            "FAILED" => Self::Failed,
            _ => Self::Discovered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Podcast {
    pub id: i64,
    pub feed_url: String,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Inclusive upper bound on publish date for audio download. Episodes
    /// published after this date are discovered but never downloaded.
    pub download_until_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub podcast_id: i64,
    pub guid: Option<String>,
    pub content_hash: String,
    pub title: String,
    pub description: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub audio_url: String,
    pub audio_file_path: Option<String>,
    /// Number of transcription parts, set once the split plan is known.
    pub part_count: Option<u32>,
    pub status: EpisodeStatus,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A stored transcript segment, ordered by (part_index, segment_index)
/// within an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: i64,
    pub episode_id: i64,
    pub part_index: u32,
    pub segment_index: u32,
    pub start_ms: i64,
    pub end_ms: i64,
    pub speaker_label: Option<String>,
    pub text: String,
}

/// A transcript segment as produced by one transcription part, before it
/// has been assigned a row id and segment index.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub speaker_label: Option<String>,
    pub text: String,
}

/// A search chunk ready for insertion at finalize time.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: u32,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub speaker_labels: Option<String>,
    pub embedding: Vec<f32>,
}

/// A search chunk joined with its episode, as retrieved for question
/// answering. Only chunks of `INDEXED` episodes are ever returned.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub episode_id: i64,
    pub episode_title: String,
    pub episode_audio_url: String,
    pub chunk_index: u32,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub speaker_labels: Option<String>,
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_strings() {
        let expected = [
            (EpisodeStatus::Discovered, "DISCOVERED"),
            (EpisodeStatus::Downloading, "DOWNLOADING"),
            (EpisodeStatus::Downloaded, "DOWNLOADED"),
            (EpisodeStatus::Transcribing, "TRANSCRIBING"),
            (EpisodeStatus::Transcribed, "TRANSCRIBED"),
            (EpisodeStatus::Indexing, "INDEXING"),
            (EpisodeStatus::Indexed, "INDEXED"),
            (EpisodeStatus::Failed, "FAILED"),
        ];
        for (status, text) in expected {
            assert_eq!(status.to_string(), text);
            assert_eq!(EpisodeStatus::from(text.to_string()), status);
            // serde uses the same strings as Display
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(text.to_string())
            );
        }
    }

    #[test]
    fn test_status_unknown_string_defaults_to_discovered() {
        assert_eq!(
            EpisodeStatus::from("processing".to_string()),
            EpisodeStatus::Discovered
        );
    }
}
