//! SQLite-backed durable memory store.
//!
//! Owns the four memory entity types (user facts, group facts, sentiment
//! scores, episodic summaries) plus the link ledger used for repost
//! detection. No other component touches these rows directly.
//!
//! Thread-safe via an internal `Mutex<Connection>`. All writes are
//! serialized; reads can proceed concurrently with WAL mode on the SQLite
//! side, though we still acquire the mutex for simplicity.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

use super::schema::{apply_schema, apply_vec_schema, read_schema_version};
use super::types::{
    EpisodicSummary, GroupFact, GroupFactCategory, Importance, LinkRecord, SentimentScore,
    UserFact, apply_delta, clamp_delta, now_epoch_secs,
};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension as an auto extension so every
/// connection opened after this call can use `vec0` virtual tables.
/// Process-wide; runs once.
fn ensure_sqlite_vec_loaded() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init has the auto-extension entry-point
        // signature SQLite expects; this is the documented way to load
        // sqlite-vec with a bundled rusqlite.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

/// Row caps enforced at insert time.
#[derive(Debug, Clone, Copy)]
pub struct StoreCaps {
    /// Maximum facts retained per user.
    pub max_user_facts: usize,
    /// Maximum group facts retained in total.
    pub max_group_facts: usize,
    /// Maximum episodic summaries retained in total.
    pub max_summaries: usize,
}

impl Default for StoreCaps {
    fn default() -> Self {
        Self {
            max_user_facts: 500,
            max_group_facts: 1000,
            max_summaries: 200,
        }
    }
}

/// Fields for a new episodic summary row.
pub struct NewSummary<'a> {
    pub channel_id: &'a str,
    pub summary: &'a str,
    pub participant_ids: &'a [String],
    pub message_count: i64,
    pub started_at: u64,
    pub ended_at: u64,
    pub embedding: Option<&'a [f32]>,
}

/// Fields for a new link-ledger row.
pub struct NewLink<'a> {
    pub url: &'a str,
    pub normalized: &'a str,
    pub author_id: &'a str,
    pub author_name: &'a str,
    pub channel_id: &'a str,
    pub message_url: &'a str,
    pub posted_at: u64,
}

/// SQLite-backed memory store.
pub struct MemoryStore {
    db_path: PathBuf,
    caps: StoreCaps,
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    ///
    /// Loads the sqlite-vec extension before opening so the vector index
    /// tables can be created alongside the relational ones.
    pub fn open(db_path: &Path, caps: StoreCaps) -> Result<Self, MemoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        ensure_sqlite_vec_loaded();
        let conn = Connection::open(db_path)?;
        apply_schema(&conn)?;
        apply_vec_schema(&conn)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            caps,
            conn: Mutex::new(conn),
        })
    }

    /// Returns the database file path.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Read the current schema version from the database.
    pub fn schema_version(&self) -> Result<Option<u32>, MemoryError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    // -----------------------------------------------------------------------
    // User facts
    // -----------------------------------------------------------------------

    /// Insert a new user fact, evicting first if the per-user cap is reached.
    ///
    /// When `embedding` is provided it is written to both the row and the
    /// vector index in the same transaction.
    pub fn insert_user_fact(
        &self,
        user_id: &str,
        display_name: &str,
        fact: &str,
        importance: Importance,
        embedding: Option<&[f32]>,
    ) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let tx = conn.unchecked_transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM user_facts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let cap = self.caps.max_user_facts as i64;
        if count >= cap {
            let excess = count - cap + 1;
            let evicted = evict_facts(&tx, "user_facts", "vec_user_facts", Some(user_id), excess)?;
            debug!(user_id, evicted, "user fact cap reached, evicted");
        }

        let blob = embedding.map(embedding_to_blob);
        tx.execute(
            "INSERT INTO user_facts \
             (user_id, display_name, fact, importance, embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![user_id, display_name, fact, importance.as_i64(), blob, now, now],
        )?;
        let id = tx.last_insert_rowid();

        if let Some(blob) = blob.as_deref() {
            tx.execute(
                "INSERT INTO vec_user_facts (fact_id, embedding) VALUES (?1, ?2)",
                params![id, blob],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    /// Find a user fact whose text exactly matches, scoped to one user.
    pub fn find_user_fact_by_text(
        &self,
        user_id: &str,
        fact: &str,
    ) -> Result<Option<i64>, MemoryError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM user_facts WHERE user_id = ?1 AND fact = ?2 LIMIT 1",
                params![user_id, fact],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Merge new content into an existing user fact row.
    ///
    /// Overwrites the text, raises importance to the max of old and new,
    /// refreshes the timestamp, and invalidates the stored embedding so a
    /// background task can recompute it.
    pub fn update_user_fact(
        &self,
        id: i64,
        fact: &str,
        importance: Importance,
    ) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let tx = conn.unchecked_transaction()?;

        let rows = tx.execute(
            "UPDATE user_facts SET fact = ?1, importance = MAX(importance, ?2), \
             updated_at = ?3, embedding = NULL WHERE id = ?4",
            params![fact, importance.as_i64(), now, id],
        )?;
        if rows == 0 {
            return Err(MemoryError::NotFound(id));
        }
        tx.execute("DELETE FROM vec_user_facts WHERE fact_id = ?1", params![id])?;

        tx.commit()?;
        Ok(())
    }

    /// Most recent facts for one user, importance-first.
    pub fn recent_user_facts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<UserFact>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, display_name, fact, importance, embedding, created_at, updated_at \
             FROM user_facts WHERE user_id = ?1 \
             ORDER BY importance DESC, updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_user_fact)?;
        collect_rows(rows)
    }

    /// Fetch specific user facts by row id (order not guaranteed).
    pub fn user_facts_by_ids(&self, ids: &[i64]) -> Result<Vec<UserFact>, MemoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, user_id, display_name, fact, importance, embedding, created_at, updated_at \
             FROM user_facts WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_user_fact)?;
        collect_rows(rows)
    }

    /// All facts for one user that currently carry an embedding.
    pub fn user_facts_with_embeddings(&self, user_id: &str) -> Result<Vec<UserFact>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, display_name, fact, importance, embedding, created_at, updated_at \
             FROM user_facts WHERE user_id = ?1 AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_user_fact)?;
        collect_rows(rows)
    }

    /// Number of facts stored for one user.
    pub fn user_fact_count(&self, user_id: &str) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM user_facts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    /// Write an embedding to a user fact row and its vector index entry.
    pub fn set_user_fact_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        set_embedding(&conn, "user_facts", "vec_user_facts", "fact_id", id, embedding)
    }

    /// User facts awaiting an embedding, oldest first.
    pub fn user_facts_missing_embedding(
        &self,
        limit: usize,
    ) -> Result<Vec<(i64, String)>, MemoryError> {
        let conn = self.lock()?;
        missing_embeddings(&conn, "user_facts", "fact", limit)
    }

    /// Nearest-neighbor search over user fact embeddings.
    ///
    /// Returns `(row_id, distance)` pairs, closest first.
    pub fn knn_user_facts(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, MemoryError> {
        let conn = self.lock()?;
        knn(&conn, "vec_user_facts", "fact_id", query, k)
    }

    // -----------------------------------------------------------------------
    // Group facts
    // -----------------------------------------------------------------------

    /// Insert a new group fact, evicting first if the global cap is reached.
    pub fn insert_group_fact(
        &self,
        category: GroupFactCategory,
        fact: &str,
        related_user_ids: &[String],
        importance: Importance,
        embedding: Option<&[f32]>,
    ) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let related_json =
            serde_json::to_string(related_user_ids).unwrap_or_else(|_| "[]".to_owned());
        let tx = conn.unchecked_transaction()?;

        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM group_facts", [], |row| row.get(0))?;
        let cap = self.caps.max_group_facts as i64;
        if count >= cap {
            let excess = count - cap + 1;
            let evicted = evict_facts(&tx, "group_facts", "vec_group_facts", None, excess)?;
            debug!(evicted, "group fact cap reached, evicted");
        }

        let blob = embedding.map(embedding_to_blob);
        tx.execute(
            "INSERT INTO group_facts \
             (category, fact, related_user_ids, importance, embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                category.as_str(),
                fact,
                related_json,
                importance.as_i64(),
                blob,
                now,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        if let Some(blob) = blob.as_deref() {
            tx.execute(
                "INSERT INTO vec_group_facts (fact_id, embedding) VALUES (?1, ?2)",
                params![id, blob],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    /// Find a group fact whose text exactly matches.
    pub fn find_group_fact_by_text(&self, fact: &str) -> Result<Option<i64>, MemoryError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM group_facts WHERE fact = ?1 LIMIT 1",
                params![fact],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Merge new content into an existing group fact row.
    pub fn update_group_fact(
        &self,
        id: i64,
        fact: &str,
        importance: Importance,
    ) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let tx = conn.unchecked_transaction()?;

        let rows = tx.execute(
            "UPDATE group_facts SET fact = ?1, importance = MAX(importance, ?2), \
             updated_at = ?3, embedding = NULL WHERE id = ?4",
            params![fact, importance.as_i64(), now, id],
        )?;
        if rows == 0 {
            return Err(MemoryError::NotFound(id));
        }
        tx.execute("DELETE FROM vec_group_facts WHERE fact_id = ?1", params![id])?;

        tx.commit()?;
        Ok(())
    }

    /// Most recent group facts, importance-first.
    pub fn recent_group_facts(&self, limit: usize) -> Result<Vec<GroupFact>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, fact, related_user_ids, importance, embedding, created_at, updated_at \
             FROM group_facts ORDER BY importance DESC, updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_group_fact)?;
        collect_rows(rows)
    }

    /// Fetch specific group facts by row id (order not guaranteed).
    pub fn group_facts_by_ids(&self, ids: &[i64]) -> Result<Vec<GroupFact>, MemoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, category, fact, related_user_ids, importance, embedding, created_at, updated_at \
             FROM group_facts WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_group_fact)?;
        collect_rows(rows)
    }

    /// All group facts that currently carry an embedding.
    pub fn group_facts_with_embeddings(&self) -> Result<Vec<GroupFact>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, fact, related_user_ids, importance, embedding, created_at, updated_at \
             FROM group_facts WHERE embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([], row_to_group_fact)?;
        collect_rows(rows)
    }

    /// Total number of group facts stored.
    pub fn group_fact_count(&self) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM group_facts", [], |row| row.get(0))?)
    }

    /// Write an embedding to a group fact row and its vector index entry.
    pub fn set_group_fact_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        set_embedding(&conn, "group_facts", "vec_group_facts", "fact_id", id, embedding)
    }

    /// Group facts awaiting an embedding, oldest first.
    pub fn group_facts_missing_embedding(
        &self,
        limit: usize,
    ) -> Result<Vec<(i64, String)>, MemoryError> {
        let conn = self.lock()?;
        missing_embeddings(&conn, "group_facts", "fact", limit)
    }

    /// Nearest-neighbor search over group fact embeddings.
    pub fn knn_group_facts(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, MemoryError> {
        let conn = self.lock()?;
        knn(&conn, "vec_group_facts", "fact_id", query, k)
    }

    // -----------------------------------------------------------------------
    // Sentiment
    // -----------------------------------------------------------------------

    /// Create a zero-valued sentiment row if the user has none.
    pub fn ensure_sentiment(&self, user_id: &str, display_name: &str) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_sentiments \
             (user_id, display_name, score, reason, updated_at) VALUES (?1, ?2, 0, '', ?3)",
            params![user_id, display_name, now_epoch_secs()],
        )?;
        Ok(())
    }

    /// Current sentiment row for one user, if any.
    pub fn sentiment_for(&self, user_id: &str) -> Result<Option<SentimentScore>, MemoryError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT user_id, display_name, score, reason, updated_at \
                 FROM user_sentiments WHERE user_id = ?1",
                params![user_id],
                row_to_sentiment,
            )
            .optional()?;
        Ok(row)
    }

    /// Sentiment rows for a set of users (missing users simply absent).
    pub fn sentiments_for(&self, user_ids: &[String]) -> Result<Vec<SentimentScore>, MemoryError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT user_id, display_name, score, reason, updated_at \
             FROM user_sentiments WHERE user_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), row_to_sentiment)?;
        collect_rows(rows)
    }

    /// Apply a bounded sentiment delta and return the new score.
    ///
    /// The delta is clamped to `[-1.0, +1.0]` before accumulation and the
    /// resulting score is clamped to `[-5.0, +5.0]`, rounded to two decimal
    /// places.
    pub fn apply_sentiment_delta(
        &self,
        user_id: &str,
        display_name: &str,
        delta: f64,
        reason: &str,
    ) -> Result<f64, MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let tx = conn.unchecked_transaction()?;

        let old: Option<f64> = tx
            .query_row(
                "SELECT score FROM user_sentiments WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        let new_score = apply_delta(old.unwrap_or(0.0), clamp_delta(delta));

        tx.execute(
            "INSERT INTO user_sentiments (user_id, display_name, score, reason, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(user_id) DO UPDATE SET \
               display_name = ?2, score = ?3, reason = ?4, updated_at = ?5",
            params![user_id, display_name, new_score, reason, now],
        )?;

        tx.commit()?;
        Ok(new_score)
    }

    // -----------------------------------------------------------------------
    // Episodic summaries
    // -----------------------------------------------------------------------

    /// Insert a new episodic summary, then evict oldest rows beyond the cap.
    pub fn insert_summary(&self, s: &NewSummary<'_>) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let participants_json =
            serde_json::to_string(s.participant_ids).unwrap_or_else(|_| "[]".to_owned());
        let blob = s.embedding.map(embedding_to_blob);
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO episodic_summaries \
             (channel_id, summary, participant_ids, message_count, started_at, ended_at, \
              embedding, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                s.channel_id,
                s.summary,
                participants_json,
                s.message_count,
                s.started_at,
                s.ended_at,
                blob,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        if let Some(blob) = blob.as_deref() {
            tx.execute(
                "INSERT INTO vec_summaries (summary_id, embedding) VALUES (?1, ?2)",
                params![id, blob],
            )?;
        }

        // Oldest-first eviction beyond the global cap. Summaries have no
        // importance tier; age alone decides.
        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM episodic_summaries", [], |row| row.get(0))?;
        let cap = self.caps.max_summaries as i64;
        if count > cap {
            let excess = count - cap;
            let mut stmt = tx.prepare(
                "SELECT id FROM episodic_summaries ORDER BY created_at ASC, id ASC LIMIT ?1",
            )?;
            let evict_ids: Vec<i64> = stmt
                .query_map(params![excess], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            drop(stmt);
            for evict_id in &evict_ids {
                tx.execute(
                    "DELETE FROM vec_summaries WHERE summary_id = ?1",
                    params![evict_id],
                )?;
                tx.execute("DELETE FROM episodic_summaries WHERE id = ?1", params![evict_id])?;
            }
            debug!(evicted = evict_ids.len(), "summary cap reached, evicted oldest");
        }

        tx.commit()?;
        Ok(id)
    }

    /// Most recent summaries for one channel, newest first.
    pub fn recent_channel_summaries(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<EpisodicSummary>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, summary, participant_ids, message_count, started_at, \
             ended_at, embedding, created_at \
             FROM episodic_summaries WHERE channel_id = ?1 ORDER BY ended_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel_id, limit as i64], row_to_summary)?;
        collect_rows(rows)
    }

    /// Fetch specific summaries by row id (order not guaranteed).
    pub fn summaries_by_ids(&self, ids: &[i64]) -> Result<Vec<EpisodicSummary>, MemoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, channel_id, summary, participant_ids, message_count, started_at, \
             ended_at, embedding, created_at \
             FROM episodic_summaries WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_summary)?;
        collect_rows(rows)
    }

    /// Total number of summaries stored.
    pub fn summary_count(&self) -> Result<i64, MemoryError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM episodic_summaries", [], |row| row.get(0))?)
    }

    /// Write an embedding to a summary row and its vector index entry.
    pub fn set_summary_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        set_embedding(
            &conn,
            "episodic_summaries",
            "vec_summaries",
            "summary_id",
            id,
            embedding,
        )
    }

    /// Summaries awaiting an embedding, oldest first.
    pub fn summaries_missing_embedding(
        &self,
        limit: usize,
    ) -> Result<Vec<(i64, String)>, MemoryError> {
        let conn = self.lock()?;
        missing_embeddings(&conn, "episodic_summaries", "summary", limit)
    }

    /// Nearest-neighbor search over summary embeddings.
    pub fn knn_summaries(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, MemoryError> {
        let conn = self.lock()?;
        knn(&conn, "vec_summaries", "summary_id", query, k)
    }

    // -----------------------------------------------------------------------
    // Link ledger
    // -----------------------------------------------------------------------

    /// First sighting of a normalized URL, if recorded.
    pub fn lookup_link(&self, normalized: &str) -> Result<Option<LinkRecord>, MemoryError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, url, normalized, author_id, author_name, channel_id, message_url, \
                 posted_at FROM links WHERE normalized = ?1",
                params![normalized],
                row_to_link,
            )
            .optional()?;
        Ok(row)
    }

    /// Record a link sighting. Returns `true` if this was the first one.
    pub fn record_link(&self, link: &NewLink<'_>) -> Result<bool, MemoryError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO links \
             (url, normalized, author_id, author_name, channel_id, message_url, posted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                link.url,
                link.normalized,
                link.author_id,
                link.author_name,
                link.channel_id,
                link.message_url,
                link.posted_at
            ],
        )?;
        Ok(rows > 0)
    }

    /// All host patterns excluded from repost detection.
    pub fn exclusion_patterns(&self) -> Result<Vec<String>, MemoryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT pattern FROM link_exclusions ORDER BY pattern")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        collect_rows(rows)
    }

    /// Add an exclusion pattern (idempotent).
    pub fn add_exclusion(&self, pattern: &str) -> Result<(), MemoryError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO link_exclusions (pattern) VALUES (?1)",
            params![pattern],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Acquire the connection mutex.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MemoryError> {
        self.conn.lock().map_err(|e| MemoryError::Lock(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the memory store.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("row not found: {0}")]
    NotFound(i64),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

// ---------------------------------------------------------------------------
// Embedding blob encoding
// ---------------------------------------------------------------------------

/// Encode an embedding as little-endian f32 bytes for BLOB storage and
/// vec0 queries.
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a BLOB back into an embedding vector.
pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Shared SQL helpers
// ---------------------------------------------------------------------------

/// Evict the lowest-importance, oldest rows from a fact table.
///
/// `scope_user` narrows eviction to one user's rows (user facts); `None`
/// evicts at global scope (group facts). Vector index entries are removed
/// alongside. Returns the number of rows evicted.
fn evict_facts(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    vec_table: &str,
    scope_user: Option<&str>,
    excess: i64,
) -> Result<usize, MemoryError> {
    let evict_ids: Vec<i64> = match scope_user {
        Some(user_id) => {
            let sql = format!(
                "SELECT id FROM {table} WHERE user_id = ?1 \
                 ORDER BY importance ASC, created_at ASC, id ASC LIMIT ?2"
            );
            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(params![user_id, excess], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        }
        None => {
            let sql = format!(
                "SELECT id FROM {table} ORDER BY importance ASC, created_at ASC, id ASC LIMIT ?1"
            );
            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(params![excess], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        }
    };

    for id in &evict_ids {
        tx.execute(
            &format!("DELETE FROM {vec_table} WHERE fact_id = ?1"),
            params![id],
        )?;
        tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
    }
    Ok(evict_ids.len())
}

/// Write an embedding to a base row and refresh its vector index entry.
///
/// vec0 has no UPSERT; delete then insert.
fn set_embedding(
    conn: &Connection,
    table: &str,
    vec_table: &str,
    vec_key: &str,
    id: i64,
    embedding: &[f32],
) -> Result<(), MemoryError> {
    let blob = embedding_to_blob(embedding);
    let tx = conn.unchecked_transaction()?;

    let rows = tx.execute(
        &format!("UPDATE {table} SET embedding = ?1 WHERE id = ?2"),
        params![blob, id],
    )?;
    if rows == 0 {
        return Err(MemoryError::NotFound(id));
    }

    tx.execute(
        &format!("DELETE FROM {vec_table} WHERE {vec_key} = ?1"),
        params![id],
    )?;
    tx.execute(
        &format!("INSERT INTO {vec_table} ({vec_key}, embedding) VALUES (?1, ?2)"),
        params![id, blob],
    )?;

    tx.commit()?;
    Ok(())
}

/// Rows with a NULL embedding, oldest first, as `(id, text)` pairs.
fn missing_embeddings(
    conn: &Connection,
    table: &str,
    text_col: &str,
    limit: usize,
) -> Result<Vec<(i64, String)>, MemoryError> {
    let sql = format!(
        "SELECT id, {text_col} FROM {table} WHERE embedding IS NULL ORDER BY id ASC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    collect_rows(rows)
}

/// vec0 nearest-neighbor query, closest first.
fn knn(
    conn: &Connection,
    vec_table: &str,
    vec_key: &str,
    query: &[f32],
    k: usize,
) -> Result<Vec<(i64, f32)>, MemoryError> {
    let blob = embedding_to_blob(query);
    let sql = format!(
        "SELECT {vec_key}, distance FROM {vec_table} \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![blob, k as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f32>(1)?))
    })?;
    collect_rows(rows)
}

/// Collect a rusqlite row iterator, surfacing the first row error.
fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, MemoryError> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn row_to_user_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserFact> {
    let importance: i64 = row.get(4)?;
    let blob: Option<Vec<u8>> = row.get(5)?;
    Ok(UserFact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        fact: row.get(3)?,
        importance: Importance::from_i64(importance),
        embedding: blob.map(|b| blob_to_embedding(&b)),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_group_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupFact> {
    let category: String = row.get(1)?;
    let related_json: String = row.get(3)?;
    let importance: i64 = row.get(4)?;
    let blob: Option<Vec<u8>> = row.get(5)?;
    Ok(GroupFact {
        id: row.get(0)?,
        category: GroupFactCategory::from_str_lossy(&category),
        fact: row.get(2)?,
        related_user_ids: serde_json::from_str(&related_json).unwrap_or_default(),
        importance: Importance::from_i64(importance),
        embedding: blob.map(|b| blob_to_embedding(&b)),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_sentiment(row: &rusqlite::Row<'_>) -> rusqlite::Result<SentimentScore> {
    Ok(SentimentScore {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        score: row.get(2)?,
        reason: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodicSummary> {
    let participants_json: String = row.get(3)?;
    let blob: Option<Vec<u8>> = row.get(7)?;
    Ok(EpisodicSummary {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        summary: row.get(2)?,
        participant_ids: serde_json::from_str(&participants_json).unwrap_or_default(),
        message_count: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        embedding: blob.map(|b| blob_to_embedding(&b)),
        created_at: row.get(8)?,
    })
}

fn row_to_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkRecord> {
    Ok(LinkRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        normalized: row.get(2)?,
        author_id: row.get(3)?,
        author_name: row.get(4)?,
        channel_id: row.get(5)?,
        message_url: row.get(6)?,
        posted_at: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::super::schema::CURRENT_SCHEMA_VERSION;
    use super::*;

    fn test_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let store =
            MemoryStore::open(&dir.path().join("test.db"), StoreCaps::default()).expect("open");
        (dir, store)
    }

    fn test_store_with_caps(caps: StoreCaps) -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let store = MemoryStore::open(&dir.path().join("test.db"), caps).expect("open");
        (dir, store)
    }

    /// Deterministic normalized vector for index tests.
    fn mock_embedding(seed: f32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..384).map(|i| ((i as f32) * seed).sin()).collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    #[test]
    fn open_applies_schema_and_version() {
        let (_dir, store) = test_store();
        let version = store.schema_version().expect("schema_version");
        assert_eq!(version, Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn insert_and_list_user_facts_importance_first() {
        let (_dir, store) = test_store();

        store
            .insert_user_fact("u1", "Dave", "likes pizza", Importance::Light, None)
            .expect("insert light");
        store
            .insert_user_fact("u1", "Dave", "has a cat named Biscuit", Importance::Defining, None)
            .expect("insert defining");
        store
            .insert_user_fact("u1", "Dave", "works nights", Importance::Standard, None)
            .expect("insert standard");

        let facts = store.recent_user_facts("u1", 50).expect("list");
        assert_eq!(facts.len(), 3);
        assert_eq!(facts[0].fact, "has a cat named Biscuit");
        assert_eq!(facts[0].importance, Importance::Defining);
        assert_eq!(facts[2].importance, Importance::Light);
    }

    #[test]
    fn exact_text_lookup_is_scoped_to_user() {
        let (_dir, store) = test_store();

        let id = store
            .insert_user_fact("u1", "Dave", "likes pizza", Importance::Standard, None)
            .expect("insert");

        assert_eq!(
            store.find_user_fact_by_text("u1", "likes pizza").expect("find"),
            Some(id)
        );
        assert_eq!(
            store.find_user_fact_by_text("u2", "likes pizza").expect("find other user"),
            None
        );
    }

    #[test]
    fn update_user_fact_merges_and_invalidates_embedding() {
        let (_dir, store) = test_store();

        let emb = mock_embedding(0.3);
        let id = store
            .insert_user_fact("u1", "Dave", "likes pizza", Importance::Defining, Some(&emb))
            .expect("insert");

        store
            .update_user_fact(id, "loves pepperoni pizza", Importance::Light)
            .expect("update");

        let facts = store.user_facts_by_ids(&[id]).expect("fetch");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].fact, "loves pepperoni pizza");
        // Importance never drops on merge.
        assert_eq!(facts[0].importance, Importance::Defining);
        // Embedding is invalidated for recomputation.
        assert!(facts[0].embedding.is_none());
        let pending = store.user_facts_missing_embedding(10).expect("pending");
        assert!(pending.iter().any(|(pid, _)| *pid == id));
    }

    #[test]
    fn update_missing_fact_is_not_found() {
        let (_dir, store) = test_store();
        let err = store
            .update_user_fact(9999, "nope", Importance::Light)
            .expect_err("should fail");
        assert!(matches!(err, MemoryError::NotFound(9999)));
    }

    #[test]
    fn user_fact_cap_evicts_lowest_importance_oldest() {
        let (_dir, store) = test_store_with_caps(StoreCaps {
            max_user_facts: 3,
            ..StoreCaps::default()
        });

        let doomed = store
            .insert_user_fact("u1", "Dave", "fact one", Importance::Light, None)
            .expect("insert 1");
        store
            .insert_user_fact("u1", "Dave", "fact two", Importance::Defining, None)
            .expect("insert 2");
        store
            .insert_user_fact("u1", "Dave", "fact three", Importance::Standard, None)
            .expect("insert 3");

        // Fourth insert evicts exactly one row and leaves the store at cap.
        store
            .insert_user_fact("u1", "Dave", "fact four", Importance::Standard, None)
            .expect("insert 4");

        assert_eq!(store.user_fact_count("u1").expect("count"), 3);
        let remaining = store.recent_user_facts("u1", 50).expect("list");
        assert!(remaining.iter().all(|f| f.id != doomed));
        assert!(remaining.iter().any(|f| f.fact == "fact four"));
    }

    #[test]
    fn user_fact_cap_is_per_user() {
        let (_dir, store) = test_store_with_caps(StoreCaps {
            max_user_facts: 2,
            ..StoreCaps::default()
        });

        store
            .insert_user_fact("u1", "Dave", "a", Importance::Standard, None)
            .expect("u1 a");
        store
            .insert_user_fact("u1", "Dave", "b", Importance::Standard, None)
            .expect("u1 b");
        store
            .insert_user_fact("u2", "Erin", "c", Importance::Standard, None)
            .expect("u2 c");

        // u2 is under its own cap; nothing evicted from u1.
        assert_eq!(store.user_fact_count("u1").expect("count u1"), 2);
        assert_eq!(store.user_fact_count("u2").expect("count u2"), 1);
    }

    #[test]
    fn group_fact_roundtrip_with_category() {
        let (_dir, store) = test_store();

        let id = store
            .insert_group_fact(
                GroupFactCategory::Joke,
                "the forklift incident",
                &["u1".to_owned(), "u2".to_owned()],
                Importance::Standard,
                None,
            )
            .expect("insert");

        let facts = store.group_facts_by_ids(&[id]).expect("fetch");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, GroupFactCategory::Joke);
        assert_eq!(facts[0].related_user_ids, vec!["u1".to_owned(), "u2".to_owned()]);
    }

    #[test]
    fn group_fact_cap_evicts_at_global_scope() {
        let (_dir, store) = test_store_with_caps(StoreCaps {
            max_group_facts: 2,
            ..StoreCaps::default()
        });

        store
            .insert_group_fact(GroupFactCategory::Event, "old light", &[], Importance::Light, None)
            .expect("insert 1");
        store
            .insert_group_fact(GroupFactCategory::Event, "keeper", &[], Importance::Defining, None)
            .expect("insert 2");
        store
            .insert_group_fact(GroupFactCategory::Event, "newest", &[], Importance::Standard, None)
            .expect("insert 3");

        assert_eq!(store.group_fact_count().expect("count"), 2);
        let remaining = store.recent_group_facts(10).expect("list");
        assert!(remaining.iter().all(|f| f.fact != "old light"));
    }

    #[test]
    fn sentiment_lazy_row_and_delta_clamps() {
        let (_dir, store) = test_store();

        store.ensure_sentiment("u1", "Dave").expect("ensure");
        let row = store.sentiment_for("u1").expect("get").expect("exists");
        assert_eq!(row.score, 0.0);

        // Delta larger than the per-update bound is clamped to +1.0.
        let score = store
            .apply_sentiment_delta("u1", "Dave", 2.5, "great joke")
            .expect("apply");
        assert!((score - 1.0).abs() < f64::EPSILON);

        // Accumulation clamps at +5.0.
        for _ in 0..10 {
            store
                .apply_sentiment_delta("u1", "Dave", 1.0, "still great")
                .expect("apply");
        }
        let row = store.sentiment_for("u1").expect("get").expect("exists");
        assert!((row.score - 5.0).abs() < f64::EPSILON);

        // And at -5.0 on the way down.
        for _ in 0..20 {
            store
                .apply_sentiment_delta("u1", "Dave", -1.0, "turned on us")
                .expect("apply");
        }
        let row = store.sentiment_for("u1").expect("get").expect("exists");
        assert!((row.score + 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sentiment_rounds_to_two_decimals() {
        let (_dir, store) = test_store();
        let score = store
            .apply_sentiment_delta("u1", "Dave", 0.111, "minor")
            .expect("apply");
        assert!((score - 0.11).abs() < f64::EPSILON);
    }

    #[test]
    fn ensure_sentiment_does_not_reset_existing() {
        let (_dir, store) = test_store();
        store
            .apply_sentiment_delta("u1", "Dave", 0.5, "initial")
            .expect("apply");
        store.ensure_sentiment("u1", "Dave").expect("ensure");
        let row = store.sentiment_for("u1").expect("get").expect("exists");
        assert!((row.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_insert_and_channel_listing() {
        let (_dir, store) = test_store();

        for i in 0..3 {
            store
                .insert_summary(&NewSummary {
                    channel_id: "c1",
                    summary: &format!("episode {i}"),
                    participant_ids: &["u1".to_owned()],
                    message_count: 10,
                    started_at: 1_000 + i,
                    ended_at: 2_000 + i,
                    embedding: None,
                })
                .expect("insert");
        }
        store
            .insert_summary(&NewSummary {
                channel_id: "c2",
                summary: "other channel",
                participant_ids: &[],
                message_count: 8,
                started_at: 1_500,
                ended_at: 2_500,
                embedding: None,
            })
            .expect("insert other");

        let recent = store.recent_channel_summaries("c1", 2).expect("list");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].summary, "episode 2");
        assert_eq!(recent[1].summary, "episode 1");
    }

    #[test]
    fn summary_cap_evicts_oldest_first() {
        let (_dir, store) = test_store_with_caps(StoreCaps {
            max_summaries: 2,
            ..StoreCaps::default()
        });

        let first = store
            .insert_summary(&NewSummary {
                channel_id: "c1",
                summary: "oldest",
                participant_ids: &[],
                message_count: 5,
                started_at: 1,
                ended_at: 2,
                embedding: None,
            })
            .expect("insert 1");
        store
            .insert_summary(&NewSummary {
                channel_id: "c1",
                summary: "middle",
                participant_ids: &[],
                message_count: 5,
                started_at: 3,
                ended_at: 4,
                embedding: None,
            })
            .expect("insert 2");
        store
            .insert_summary(&NewSummary {
                channel_id: "c1",
                summary: "newest",
                participant_ids: &[],
                message_count: 5,
                started_at: 5,
                ended_at: 6,
                embedding: None,
            })
            .expect("insert 3");

        assert_eq!(store.summary_count().expect("count"), 2);
        assert!(store.summaries_by_ids(&[first]).expect("fetch").is_empty());
    }

    #[test]
    fn knn_returns_closest_fact_first() {
        let (_dir, store) = test_store();

        let a = mock_embedding(0.1);
        let b = mock_embedding(0.9);
        let id_a = store
            .insert_user_fact("u1", "Dave", "close fact", Importance::Standard, Some(&a))
            .expect("insert a");
        store
            .insert_user_fact("u1", "Dave", "far fact", Importance::Standard, Some(&b))
            .expect("insert b");

        // Query with a vector near `a`.
        let hits = store.knn_user_facts(&mock_embedding(0.1001), 2).expect("knn");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, id_a);
        assert!(hits[0].1 < hits[1].1);
    }

    #[test]
    fn set_embedding_clears_pending_and_serves_knn() {
        let (_dir, store) = test_store();

        let id = store
            .insert_user_fact("u1", "Dave", "pending fact", Importance::Standard, None)
            .expect("insert");
        let pending = store.user_facts_missing_embedding(10).expect("pending");
        assert_eq!(pending, vec![(id, "pending fact".to_owned())]);

        let emb = mock_embedding(0.5);
        store.set_user_fact_embedding(id, &emb).expect("set embedding");

        assert!(store.user_facts_missing_embedding(10).expect("pending").is_empty());
        let hits = store.knn_user_facts(&emb, 1).expect("knn");
        assert_eq!(hits[0].0, id);
    }

    #[test]
    fn set_embedding_twice_replaces_index_entry() {
        let (_dir, store) = test_store();

        let id = store
            .insert_user_fact("u1", "Dave", "moving target", Importance::Standard, None)
            .expect("insert");
        store
            .set_user_fact_embedding(id, &mock_embedding(0.2))
            .expect("first set");
        store
            .set_user_fact_embedding(id, &mock_embedding(0.7))
            .expect("second set");

        let hits = store.knn_user_facts(&mock_embedding(0.7), 5).expect("knn");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id);
    }

    #[test]
    fn link_ledger_first_sighting_wins() {
        let (_dir, store) = test_store();

        let inserted = store
            .record_link(&NewLink {
                url: "https://example.com/article?utm_source=x",
                normalized: "example.com/article",
                author_id: "u1",
                author_name: "Dave",
                channel_id: "c1",
                message_url: "https://discord.com/channels/1/2/3",
                posted_at: 1_000,
            })
            .expect("first record");
        assert!(inserted);

        let repost = store
            .record_link(&NewLink {
                url: "https://example.com/article",
                normalized: "example.com/article",
                author_id: "u2",
                author_name: "Erin",
                channel_id: "c2",
                message_url: "https://discord.com/channels/1/2/4",
                posted_at: 2_000,
            })
            .expect("second record");
        assert!(!repost);

        let original = store
            .lookup_link("example.com/article")
            .expect("lookup")
            .expect("exists");
        assert_eq!(original.author_name, "Dave");
        assert_eq!(original.posted_at, 1_000);
    }

    #[test]
    fn exclusion_patterns_are_seeded_and_extendable() {
        let (_dir, store) = test_store();

        let patterns = store.exclusion_patterns().expect("patterns");
        assert!(patterns.iter().any(|p| p == "tenor.com"));

        store.add_exclusion("example.org").expect("add");
        store.add_exclusion("example.org").expect("add again");
        let patterns = store.exclusion_patterns().expect("patterns");
        assert_eq!(patterns.iter().filter(|p| *p == "example.org").count(), 1);
    }

    #[test]
    fn blob_roundtrip_preserves_values() {
        let emb = mock_embedding(0.42);
        let blob = embedding_to_blob(&emb);
        assert_eq!(blob.len(), emb.len() * 4);
        let back = blob_to_embedding(&blob);
        assert_eq!(back, emb);
    }

    #[test]
    fn concurrent_inserts_preserve_rows() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = std::sync::Arc::new(
            MemoryStore::open(&dir.path().join("test.db"), StoreCaps::default()).expect("open"),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let s = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                s.insert_user_fact(
                    "u1",
                    "Dave",
                    &format!("concurrent fact {i}"),
                    Importance::Standard,
                    None,
                )
                .expect("concurrent insert");
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(store.user_fact_count("u1").expect("count"), 10);
    }
}
