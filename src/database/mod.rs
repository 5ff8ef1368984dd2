pub mod models;


use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        // Initialize schema
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS podcasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                author TEXT,
                description TEXT,
                image_url TEXT,
                last_synced_at TEXT,
                download_until_date TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                podcast_id INTEGER NOT NULL,
                guid TEXT,
                content_hash TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                published_date TEXT,
                duration_seconds INTEGER,
                audio_url TEXT NOT NULL,
                audio_file_path TEXT,
                part_count INTEGER,
                status TEXT NOT NULL DEFAULT 'DISCOVERED',
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (podcast_id) REFERENCES podcasts(id) ON DELETE CASCADE,
                UNIQUE(podcast_id, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_podcast ON episodes(podcast_id);
            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_episodes_guid
                ON episodes(podcast_id, guid) WHERE guid IS NOT NULL;

            -- Timestamped transcript segments, replaced wholesale per
            -- (episode, part) when a part is retried
            CREATE TABLE IF NOT EXISTS transcript_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                part_index INTEGER NOT NULL,
                segment_index INTEGER NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                speaker_label TEXT,
                text TEXT NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                UNIQUE(episode_id, part_index, segment_index)
            );

            CREATE INDEX IF NOT EXISTS idx_segments_episode
                ON transcript_segments(episode_id, part_index);

            -- Embedded retrieval chunks, written together with the INDEXED
            -- status flip so partial transcripts are never searchable
            CREATE TABLE IF NOT EXISTS search_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                text TEXT NOT NULL,
                speaker_labels TEXT,
                embedding BLOB NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                UNIQUE(episode_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_episode ON search_chunks(episode_id);
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Podcast queries
    // =========================================================================

    pub fn insert_podcast(
        &self,
        feed_url: &str,
        title: &str,
        author: Option<&str>,
        description: Option<&str>,
        image_url: Option<&str>,
        download_until_date: Option<NaiveDate>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO podcasts (feed_url, title, author, description, image_url, download_until_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                feed_url,
                title,
                author,
                description,
                image_url,
                download_until_date.map(|d| d.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_podcast(&self, id: i64) -> Result<Option<Podcast>> {
        let conn = self.conn.lock().unwrap();
        let podcast = conn
            .query_row(
                "SELECT id, feed_url, title, author, description, image_url,
                        last_synced_at, download_until_date
                 FROM podcasts WHERE id = ?1",
                params![id],
                podcast_from_row,
            )
            .optional()?;
        Ok(podcast)
    }

    pub fn get_podcast_by_feed_url(&self, feed_url: &str) -> Result<Option<Podcast>> {
        let conn = self.conn.lock().unwrap();
        let podcast = conn
            .query_row(
                "SELECT id, feed_url, title, author, description, image_url,
                        last_synced_at, download_until_date
                 FROM podcasts WHERE feed_url = ?1",
                params![feed_url],
                podcast_from_row,
            )
            .optional()?;
        Ok(podcast)
    }

    pub fn list_podcasts(&self) -> Result<Vec<Podcast>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, feed_url, title, author, description, image_url,
                    last_synced_at, download_until_date
             FROM podcasts ORDER BY id",
        )?;
        let podcasts = stmt
            .query_map([], podcast_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(podcasts)
    }

    pub fn update_podcast_metadata(
        &self,
        id: i64,
        title: &str,
        author: Option<&str>,
        description: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE podcasts SET
                title = ?1,
                author = COALESCE(?2, author),
                description = COALESCE(?3, description),
                image_url = COALESCE(?4, image_url)
             WHERE id = ?5",
            params![title, author, description, image_url, id],
        )?;
        Ok(())
    }

    pub fn touch_last_synced(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE podcasts SET last_synced_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn insert_episode(
        &self,
        podcast_id: i64,
        guid: Option<&str>,
        content_hash: &str,
        title: &str,
        description: Option<&str>,
        published_date: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
        audio_url: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO episodes (podcast_id, guid, content_hash, title, description,
                                   published_date, duration_seconds, audio_url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                podcast_id,
                guid,
                content_hash,
                title,
                description,
                published_date.map(|d| d.to_rfc3339()),
                duration_seconds,
                audio_url,
                EpisodeStatus::Discovered.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_episode(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                "SELECT id, podcast_id, guid, content_hash, title, description,
                        published_date, duration_seconds, audio_url, audio_file_path,
                        part_count, status, error_message, created_at
                 FROM episodes WHERE id = ?1",
                params![id],
                episode_from_row,
            )
            .optional()?;
        Ok(episode)
    }

    pub fn episodes_for_podcast(&self, podcast_id: i64) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, podcast_id, guid, content_hash, title, description,
                    published_date, duration_seconds, audio_url, audio_file_path,
                    part_count, status, error_message, created_at
             FROM episodes WHERE podcast_id = ?1 ORDER BY id",
        )?;
        let episodes = stmt
            .query_map(params![podcast_id], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    pub fn episodes_with_status(&self, status: EpisodeStatus) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, podcast_id, guid, content_hash, title, description,
                    published_date, duration_seconds, audio_url, audio_file_path,
                    part_count, status, error_message, created_at
             FROM episodes WHERE status = ?1 ORDER BY id",
        )?;
        let episodes = stmt
            .query_map(params![status.to_string()], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    pub fn find_episode_by_guid(&self, podcast_id: i64, guid: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM episodes WHERE podcast_id = ?1 AND guid = ?2",
                params![podcast_id, guid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn find_episode_by_content_hash(
        &self,
        podcast_id: i64,
        content_hash: &str,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM episodes WHERE podcast_id = ?1 AND content_hash = ?2",
                params![podcast_id, content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn count_indexed_episodes(&self, podcast_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM episodes WHERE podcast_id = ?1 AND status = ?2",
            params![podcast_id, EpisodeStatus::Indexed.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // =========================================================================
    // Episode state
    // =========================================================================

    /// Compare-and-swap status update. Returns false when the episode was
    /// not in the expected state, which makes duplicate completion
    /// notifications harmless.
    pub fn try_transition_status(
        &self,
        episode_id: i64,
        from: EpisodeStatus,
        to: EpisodeStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE episodes SET status = ?1, error_message = NULL
             WHERE id = ?2 AND status = ?3",
            params![to.to_string(), episode_id, from.to_string()],
        )?;
        Ok(updated == 1)
    }

    pub fn set_episode_downloaded(
        &self,
        episode_id: i64,
        audio_file_path: &str,
        duration_seconds: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET audio_file_path = ?1, duration_seconds = ?2 WHERE id = ?3",
            params![audio_file_path, duration_seconds, episode_id],
        )?;
        Ok(())
    }

    pub fn set_episode_part_count(&self, episode_id: i64, part_count: u32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET part_count = ?1 WHERE id = ?2",
            params![part_count, episode_id],
        )?;
        Ok(())
    }

    /// Mark an episode FAILED with the last error. A no-op for INDEXED
    /// episodes, which are terminal.
    pub fn fail_episode(&self, episode_id: i64, error: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE episodes SET status = ?1, error_message = ?2
             WHERE id = ?3 AND status != ?4",
            params![
                EpisodeStatus::Failed.to_string(),
                error,
                episode_id,
                EpisodeStatus::Indexed.to_string(),
            ],
        )?;
        Ok(updated == 1)
    }

    // =========================================================================
    // Transcript index
    // =========================================================================

    /// Replace the stored segments for one transcription part. Delete and
    /// insert run in one transaction, so a retried part supersedes its
    /// earlier rows without ever exposing a mixed set.
    pub fn append_segments(
        &self,
        episode_id: i64,
        part_index: u32,
        segments: &[NewSegment],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM transcript_segments WHERE episode_id = ?1 AND part_index = ?2",
            params![episode_id, part_index],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO transcript_segments
                     (episode_id, part_index, segment_index, start_ms, end_ms, speaker_label, text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (idx, segment) in segments.iter().enumerate() {
                stmt.execute(params![
                    episode_id,
                    part_index,
                    idx as u32,
                    segment.start_ms,
                    segment.end_ms,
                    segment.speaker_label,
                    segment.text,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn segments_for_episode(&self, episode_id: i64) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, part_index, segment_index, start_ms, end_ms, speaker_label, text
             FROM transcript_segments
             WHERE episode_id = ?1
             ORDER BY part_index, segment_index",
        )?;
        let segments = stmt
            .query_map(params![episode_id], |row| {
                Ok(TranscriptSegment {
                    id: row.get(0)?,
                    episode_id: row.get(1)?,
                    part_index: row.get(2)?,
                    segment_index: row.get(3)?,
                    start_ms: row.get(4)?,
                    end_ms: row.get(5)?,
                    speaker_label: row.get(6)?,
                    text: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }

    /// Parts that already have durable segments, for crash recovery and
    /// failed-episode resume.
    pub fn parts_with_segments(&self, episode_id: i64) -> Result<Vec<u32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT part_index FROM transcript_segments
             WHERE episode_id = ?1 ORDER BY part_index",
        )?;
        let parts = stmt
            .query_map(params![episode_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts)
    }

    // =========================================================================
    // Search chunks
    // =========================================================================

    /// Finalize an episode: store its search chunks and flip the status to
    /// INDEXED in one transaction. Returns false (and writes nothing) when
    /// the episode is not INDEXING, so duplicate INDEX completions are
    /// no-ops and chunks never appear without the status flip.
    pub fn insert_chunks_and_finalize(&self, episode_id: i64, chunks: &[NewChunk]) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE episodes SET status = ?1, error_message = NULL
             WHERE id = ?2 AND status = ?3",
            params![
                EpisodeStatus::Indexed.to_string(),
                episode_id,
                EpisodeStatus::Indexing.to_string(),
            ],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM search_chunks WHERE episode_id = ?1",
            params![episode_id],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO search_chunks
                     (episode_id, chunk_index, start_ms, end_ms, text, speaker_labels, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    episode_id,
                    chunk.chunk_index,
                    chunk.start_ms,
                    chunk.end_ms,
                    chunk.text,
                    chunk.speaker_labels,
                    embedding_to_blob(&chunk.embedding),
                ])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn has_chunks(&self, episode_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM search_chunks WHERE episode_id = ?1",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All searchable chunks for a podcast. Joins through episodes and
    /// filters on INDEXED status, so partially processed episodes are
    /// invisible to retrieval.
    pub fn chunks_for_podcast(&self, podcast_id: i64) -> Result<Vec<IndexedChunk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.episode_id, e.title, e.audio_url, c.chunk_index,
                    c.start_ms, c.end_ms, c.text, c.speaker_labels, c.embedding
             FROM search_chunks c
             JOIN episodes e ON e.id = c.episode_id
             WHERE e.podcast_id = ?1 AND e.status = ?2
             ORDER BY c.episode_id, c.chunk_index",
        )?;
        let chunks = stmt
            .query_map(
                params![podcast_id, EpisodeStatus::Indexed.to_string()],
                |row| {
                    Ok(IndexedChunk {
                        episode_id: row.get(0)?,
                        episode_title: row.get(1)?,
                        episode_audio_url: row.get(2)?,
                        chunk_index: row.get(3)?,
                        start_ms: row.get(4)?,
                        end_ms: row.get(5)?,
                        text: row.get(6)?,
                        speaker_labels: row.get(7)?,
                        embedding: blob_to_embedding(&row.get::<_, Vec<u8>>(8)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }
}

// =========================================================================
// Row mapping and storage helpers
// =========================================================================

fn podcast_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Podcast> {
    Ok(Podcast {
        id: row.get(0)?,
        feed_url: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        description: row.get(4)?,
        image_url: row.get(5)?,
        last_synced_at: parse_datetime(row.get(6)?),
        download_until_date: parse_date(row.get(7)?),
    })
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        podcast_id: row.get(1)?,
        guid: row.get(2)?,
        content_hash: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        published_date: parse_datetime(row.get(6)?),
        duration_seconds: row.get(7)?,
        audio_url: row.get(8)?,
        audio_file_path: row.get(9)?,
        part_count: row.get(10)?,
        status: row.get::<_, String>(11)?.into(),
        error_message: row.get(12)?,
        created_at: parse_datetime(row.get(13)?),
    })
}

fn parse_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| s.parse::<NaiveDate>().ok())
}

fn embedding_to_blob(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
