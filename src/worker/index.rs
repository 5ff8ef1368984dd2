//! INDEX stage: window the transcript into chunks, embed each chunk, and
//! finalize the episode for search.

use crate::database::{NewChunk, TranscriptSegment};
use crate::error::AppError;
use crate::queue::Job;
use crate::worker::WorkerContext;

/// Segments per retrieval chunk.
const CHUNK_SIZE_SEGMENTS: usize = 10;

pub async fn run(ctx: &WorkerContext, job: &Job) -> Result<(), AppError> {
    let segments = ctx.db.segments_for_episode(job.resource_id)?;
    if segments.is_empty() {
        return Err(AppError::Permanent(format!(
            "Episode {} has no transcript segments to index",
            job.resource_id
        )));
    }

    let mut chunks = build_chunks(&segments);
    log::info!(
        "Embedding {} chunks for episode {}",
        chunks.len(),
        job.resource_id
    );
    for chunk in &mut chunks {
        chunk.embedding = ctx.ollama.embed(&chunk.text).await?;
    }

    ctx.pipeline.finish_index(job.resource_id, &chunks)?;
    Ok(())
}

/// Group consecutive segments into fixed-size windows. Each chunk spans
/// from its first segment's start to its last segment's end and carries
/// the distinct speaker labels seen inside it, in order of appearance.
fn build_chunks(segments: &[TranscriptSegment]) -> Vec<NewChunk> {
    segments
        .chunks(CHUNK_SIZE_SEGMENTS)
        .enumerate()
        .map(|(index, window)| {
            let text = window
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let mut labels: Vec<String> = Vec::new();
            for segment in window {
                if let Some(label) = &segment.speaker_label {
                    if !labels.iter().any(|l| l == label) {
                        labels.push(label.clone());
                    }
                }
            }
            NewChunk {
                chunk_index: index as u32,
                start_ms: window[0].start_ms,
                end_ms: window[window.len() - 1].end_ms,
                text,
                speaker_labels: if labels.is_empty() {
                    None
                } else {
                    Some(labels.join(", "))
                },
                embedding: Vec::new(),
            }
        })
        .collect()
}
