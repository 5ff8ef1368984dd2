//! DOWNLOAD stage: stream episode audio to disk, measure it, and hand the
//! episode to transcription.

use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::AppError;
use crate::queue::Job;
use crate::worker::{audio, WorkerContext};

pub async fn run(ctx: &WorkerContext, job: &Job) -> Result<(), AppError> {
    let episode = ctx
        .db
        .get_episode(job.resource_id)?
        .ok_or_else(|| AppError::NotFound(format!("episode {}", job.resource_id)))?;

    let audio_dir = ctx.config.audio_dir();
    tokio::fs::create_dir_all(&audio_dir).await?;
    let file_path = audio_dir.join(format!("{}.mp3", episode.id));

    try_download(&episode.audio_url, &file_path).await?;

    let duration_seconds = match audio::probe_duration(&file_path).await {
        Ok(seconds) => seconds,
        Err(e) => match episode.duration_seconds {
            Some(feed_duration) => {
                log::warn!(
                    "ffprobe failed for episode {}; using feed duration {}s: {}",
                    episode.id,
                    feed_duration,
                    e
                );
                feed_duration as f64
            }
            None => return Err(e),
        },
    };

    if !ctx.pipeline.finish_download(
        episode.id,
        &file_path.to_string_lossy(),
        duration_seconds.round() as i64,
    )? {
        return Ok(());
    }

    let parts =
        audio::plan_parts(&file_path, duration_seconds, ctx.config.split_seconds()).await?;
    log::info!(
        "Episode {} downloaded: {:.0}s of audio in {} part(s)",
        episode.id,
        duration_seconds,
        parts.len()
    );
    ctx.pipeline.begin_transcription(episode.id, &parts)?;
    Ok(())
}

/// Single download attempt with streaming and size validation. The partial
/// file is removed on any failure so a retry starts clean.
async fn try_download(audio_url: &str, file_path: &Path) -> Result<(), AppError> {
    log::info!("Downloading {} to {:?}", audio_url, file_path);

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .timeout(std::time::Duration::from_secs(600))
        .build()?;

    let result = stream_to_file(&client, audio_url, file_path).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(file_path).await;
    }
    result
}

async fn stream_to_file(
    client: &reqwest::Client,
    audio_url: &str,
    file_path: &Path,
) -> Result<(), AppError> {
    let response = client.get(audio_url).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let message = format!("Download returned {}: {}", status, audio_url);
        return Err(if status.is_client_error() {
            AppError::Permanent(message)
        } else {
            AppError::Transient(message)
        });
    }

    let content_length = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(file_path).await?;
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await?;

    // Validate file size against Content-Length
    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(AppError::Transient(format!(
                "Download incomplete: got {} bytes, expected {}",
                downloaded, expected
            )));
        }
    }

    log::info!("Download complete: {} bytes", downloaded);
    Ok(())
}
