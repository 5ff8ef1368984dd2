//! TRANSCRIBE stage: upload one audio part to whisper and store its timed
//! segments at the part's offset on the episode timeline.

use std::path::Path;

use crate::database::NewSegment;
use crate::error::AppError;
use crate::queue::Job;
use crate::whisper::TranscribeResponse;
use crate::worker::WorkerContext;

pub async fn run(ctx: &WorkerContext, job: &Job) -> Result<(), AppError> {
    let part_index = job.part_index.ok_or_else(|| {
        AppError::Permanent(format!("Transcribe job {} has no part index", job.job_id))
    })?;
    let audio_file_path = job.audio_file_path.as_deref().ok_or_else(|| {
        AppError::Permanent(format!("Transcribe job {} has no audio path", job.job_id))
    })?;

    let response = ctx.whisper.transcribe(Path::new(audio_file_path)).await?;

    let offset_ms = part_index as i64 * ctx.config.split_seconds() as i64 * 1000;
    let segments = segments_from_response(&response, offset_ms);
    log::info!(
        "Episode {} part {}: {} usable segments",
        job.resource_id,
        part_index,
        segments.len()
    );

    ctx.pipeline
        .finish_transcribe_part(job.resource_id, part_index, &segments)?;
    Ok(())
}

/// Convert whisper's file-relative second timestamps into episode-relative
/// milliseconds. Empty and zero-length segments are dropped.
fn segments_from_response(response: &TranscribeResponse, offset_ms: i64) -> Vec<NewSegment> {
    response
        .segments
        .iter()
        .filter_map(|segment| {
            let text = segment.text.trim();
            if text.is_empty() {
                return None;
            }
            let start_ms = offset_ms + (segment.start * 1000.0).round() as i64;
            let end_ms = offset_ms + (segment.end * 1000.0).round() as i64;
            if end_ms <= start_ms {
                return None;
            }
            Some(NewSegment {
                start_ms,
                end_ms,
                speaker_label: None,
                text: text.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whisper::WhisperSegment;

    #[test]
    fn test_segments_are_shifted_by_part_offset() {
        let response = TranscribeResponse {
            text: "hello world".to_string(),
            segments: vec![
                WhisperSegment {
                    id: 0,
                    start: 0.0,
                    end: 2.5,
                    text: " hello".to_string(),
                },
                WhisperSegment {
                    id: 1,
                    start: 2.5,
                    end: 4.02,
                    text: " world".to_string(),
                },
            ],
        };

        let segments = segments_from_response(&response, 3_600_000);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start_ms, 3_600_000);
        assert_eq!(segments[0].end_ms, 3_602_500);
        assert_eq!(segments[0].text, "hello");
        assert_eq!(segments[1].end_ms, 3_604_020);
    }

    #[test]
    fn test_blank_and_zero_length_segments_are_dropped() {
        let response = TranscribeResponse {
            text: String::new(),
            segments: vec![
                WhisperSegment {
                    id: 0,
                    start: 0.0,
                    end: 1.0,
                    text: "   ".to_string(),
                },
                WhisperSegment {
                    id: 1,
                    start: 1.0,
                    end: 1.0,
                    text: "stuck".to_string(),
                },
                WhisperSegment {
                    id: 2,
                    start: 1.0,
                    end: 2.0,
                    text: " kept".to_string(),
                },
            ],
        };

        let segments = segments_from_response(&response, 0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "kept");
    }
}
