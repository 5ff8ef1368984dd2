//! Question answering over indexed transcripts
//!
//! Embeds the question, ranks stored chunks by cosine similarity, asks the
//! chat model for an answer grounded in the top chunks, and returns
//! citations with playable timestamps. Answers are cached per podcast and
//! normalized question.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::database::{Database, IndexedChunk};
use crate::error::AppError;
use crate::ollama::OllamaClient;

/// Citations whose windows overlap or sit within this gap are merged.
const ADJACENT_GAP_MS: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub episode_title: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub speaker_labels: Vec<String>,
    pub text_snippet: String,
    pub audio_url: String,
}

pub struct QaEngine {
    db: Arc<Database>,
    ollama: Arc<OllamaClient>,
    top_k: usize,
    cache: Mutex<HashMap<String, Answer>>,
}

impl QaEngine {
    pub fn new(db: Arc<Database>, ollama: Arc<OllamaClient>, top_k: usize) -> Self {
        Self {
            db,
            ollama,
            top_k,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Answer a question against one podcast's indexed episodes. Fails
    /// with NoIndexedContent before any model call when nothing has been
    /// indexed yet.
    pub async fn answer(&self, podcast_id: i64, question: &str) -> Result<Answer, AppError> {
        if self.db.count_indexed_episodes(podcast_id)? == 0 {
            return Err(AppError::NoIndexedContent(format!(
                "podcast {} has no indexed episodes",
                podcast_id
            )));
        }

        let key = cache_key(podcast_id, question);
        if let Some(answer) = self.cache.lock().unwrap().get(&key).cloned() {
            log::debug!("Answer cache hit for {}", key);
            return Ok(answer);
        }

        let question_embedding = self.ollama.embed(question).await?;
        let chunks = self.db.chunks_for_podcast(podcast_id)?;

        let mut ranked: Vec<(f32, &IndexedChunk)> = chunks
            .iter()
            .map(|chunk| {
                (
                    cosine_similarity(&question_embedding, &chunk.embedding),
                    chunk,
                )
            })
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.top_k);

        let context = ranked
            .iter()
            .map(|(_, chunk)| format!("[{}] {}", chunk.episode_title, chunk.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "Answer the following question based only on the provided context from podcast episodes.\n\nContext:\n{}\n\nQuestion: {}\n\nAnswer:",
            context, question
        );

        let answer_text = self.ollama.generate(&prompt).await?;

        let answer = Answer {
            answer: answer_text.trim().to_string(),
            citations: coalesce_citations(&ranked),
        };
        self.cache.lock().unwrap().insert(key, answer.clone());
        Ok(answer)
    }

    #[cfg(test)]
    fn prime_cache(&self, podcast_id: i64, question: &str, answer: Answer) {
        self.cache
            .lock()
            .unwrap()
            .insert(cache_key(podcast_id, question), answer);
    }
}

struct Window<'a> {
    best_score: f32,
    end_ms: i64,
    members: Vec<&'a IndexedChunk>,
}

/// Collapse ranked hits into citations. Hits from the same episode whose
/// time windows touch are merged into one citation spanning them; the
/// final list is ordered by each citation's best hit score.
fn coalesce_citations(ranked: &[(f32, &IndexedChunk)]) -> Vec<Citation> {
    let mut by_episode: HashMap<i64, Vec<(f32, &IndexedChunk)>> = HashMap::new();
    for &(score, chunk) in ranked {
        by_episode
            .entry(chunk.episode_id)
            .or_default()
            .push((score, chunk));
    }

    let mut merged: Vec<(f32, Citation)> = Vec::new();
    for (_, mut hits) in by_episode {
        hits.sort_by_key(|(_, chunk)| chunk.start_ms);

        let mut windows: Vec<Window> = Vec::new();
        for (score, chunk) in hits {
            match windows.last_mut() {
                Some(window) if chunk.start_ms <= window.end_ms + ADJACENT_GAP_MS => {
                    window.end_ms = window.end_ms.max(chunk.end_ms);
                    if score > window.best_score {
                        window.best_score = score;
                    }
                    window.members.push(chunk);
                }
                _ => windows.push(Window {
                    best_score: score,
                    end_ms: chunk.end_ms,
                    members: vec![chunk],
                }),
            }
        }

        for window in windows {
            merged.push((window.best_score, citation_from(window)));
        }
    }

    merged.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    merged.into_iter().map(|(_, citation)| citation).collect()
}

fn citation_from(window: Window<'_>) -> Citation {
    let first = window.members[0];
    let start_ms = first.start_ms;

    let text_snippet = window
        .members
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut speaker_labels: Vec<String> = Vec::new();
    for member in &window.members {
        if let Some(labels) = &member.speaker_labels {
            for label in labels.split(", ") {
                if !speaker_labels.iter().any(|l| l == label) {
                    speaker_labels.push(label.to_string());
                }
            }
        }
    }

    Citation {
        episode_title: first.episode_title.clone(),
        start_ms,
        end_ms: window.end_ms,
        speaker_labels,
        text_snippet,
        // Media fragment so the player can seek straight to the citation
        audio_url: format!("{}#t={}", first.episode_audio_url, start_ms / 1000),
    }
}

fn cache_key(podcast_id: i64, question: &str) -> String {
    let normalized = question.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("qa:{}:{}", podcast_id, hex::encode(hasher.finalize()))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// =========================================================================
// Tests
// =========================================================================
