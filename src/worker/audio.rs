use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::AppError;

/// One transcription unit: the whole audio file, or one split part of it.
#[derive(Debug, Clone)]
pub struct PartPlan {
    pub part_index: u32,
    pub audio_file_path: String,
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    // ffprobe prints the duration as a decimal string
    duration: String,
}

/// Read the audio duration in seconds with ffprobe.
pub async fn probe_duration(audio_path: &Path) -> Result<f64, AppError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(audio_path)
        .output()
        .await
        .map_err(|e| AppError::Transient(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Transient(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::Transient(format!("Unreadable ffprobe output: {}", e)))?;
    probe
        .format
        .duration
        .parse::<f64>()
        .map_err(|e| AppError::Transient(format!("Unreadable ffprobe duration: {}", e)))
}

/// Split plan for one audio file. Files that fit in a single transcription
/// request are left untouched; longer files are cut into fixed-length parts
/// with ffmpeg stream copy. Part files that already exist are reused, so a
/// resumed episode is not split twice.
pub async fn plan_parts(
    audio_path: &Path,
    duration_seconds: f64,
    split_seconds: u64,
) -> Result<Vec<PartPlan>, AppError> {
    if duration_seconds <= split_seconds as f64 {
        return Ok(vec![PartPlan {
            part_index: 0,
            audio_file_path: audio_path.to_string_lossy().to_string(),
        }]);
    }

    let part_count = (duration_seconds / split_seconds as f64).ceil() as u32;
    let mut parts = Vec::with_capacity(part_count as usize);
    for index in 0..part_count {
        let part_path = part_file_path(audio_path, index);
        if !part_path.exists() {
            cut_part(
                audio_path,
                &part_path,
                index as u64 * split_seconds,
                split_seconds,
            )
            .await?;
        }
        parts.push(PartPlan {
            part_index: index,
            audio_file_path: part_path.to_string_lossy().to_string(),
        });
    }
    Ok(parts)
}

fn part_file_path(audio_path: &Path, part_index: u32) -> PathBuf {
    let stem = audio_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = audio_path
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp3".to_string());
    audio_path.with_file_name(format!("{}_part{}.{}", stem, part_index, extension))
}

async fn cut_part(
    source: &Path,
    target: &Path,
    offset_seconds: u64,
    length_seconds: u64,
) -> Result<(), AppError> {
    log::info!("Splitting {:?} at {}s into {:?}", source, offset_seconds, target);

    let output = Command::new("ffmpeg")
        .args(["-y", "-v", "error", "-ss", &offset_seconds.to_string()])
        .arg("-i")
        .arg(source)
        .args(["-t", &length_seconds.to_string(), "-c", "copy"])
        .arg(target)
        .output()
        .await
        .map_err(|e| AppError::Transient(format!("Failed to run ffmpeg: {}", e)))?;

    if !output.status.success() {
        // Remove any partial cut so a retry starts clean
        let _ = tokio::fs::remove_file(target).await;
        return Err(AppError::Transient(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
