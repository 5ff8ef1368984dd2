//! Podcast ingestion, transcription, and semantic search over a local model stack.

pub mod config;
pub mod database;
pub mod error;
pub mod feed;
pub mod ollama;
pub mod pipeline;
pub mod qa;
pub mod queue;
pub mod status;
pub mod whisper;
pub mod worker;

pub use config::Config;
pub use database::Database;
pub use error::AppError;
