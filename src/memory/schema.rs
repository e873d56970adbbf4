//! SQLite DDL definitions for the banter memory store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current schema version, seeded into `schema_meta` on first open.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the banter database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Durable facts about individual users.
CREATE TABLE IF NOT EXISTS user_facts (
    id           INTEGER PRIMARY KEY,
    user_id      TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    fact         TEXT NOT NULL,
    importance   INTEGER NOT NULL DEFAULT 2,
    embedding    BLOB,               -- 384 little-endian f32s, NULL until embedded
    created_at   INTEGER NOT NULL DEFAULT 0,
    updated_at   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_user_facts_user    ON user_facts(user_id);
CREATE INDEX IF NOT EXISTS idx_user_facts_updated ON user_facts(updated_at);

-- Durable facts about the bot or the group as a whole.
CREATE TABLE IF NOT EXISTS group_facts (
    id               INTEGER PRIMARY KEY,
    category         TEXT NOT NULL DEFAULT 'event',
    fact             TEXT NOT NULL,
    related_user_ids TEXT NOT NULL DEFAULT '[]',  -- JSON array of user ids
    importance       INTEGER NOT NULL DEFAULT 2,
    embedding        BLOB,
    created_at       INTEGER NOT NULL DEFAULT 0,
    updated_at       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_group_facts_updated ON group_facts(updated_at);

-- One sentiment row per user, created lazily at score zero.
CREATE TABLE IF NOT EXISTS user_sentiments (
    user_id      TEXT PRIMARY KEY,
    display_name TEXT NOT NULL DEFAULT '',
    score        REAL NOT NULL DEFAULT 0,
    reason       TEXT NOT NULL DEFAULT '',
    updated_at   INTEGER NOT NULL DEFAULT 0
);

-- Condensed episode records.
CREATE TABLE IF NOT EXISTS episodic_summaries (
    id              INTEGER PRIMARY KEY,
    channel_id      TEXT NOT NULL,
    summary         TEXT NOT NULL,
    participant_ids TEXT NOT NULL DEFAULT '[]',
    message_count   INTEGER NOT NULL DEFAULT 0,
    started_at      INTEGER NOT NULL DEFAULT 0,
    ended_at        INTEGER NOT NULL DEFAULT 0,
    embedding       BLOB,
    created_at      INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_summaries_channel ON episodic_summaries(channel_id, ended_at);
CREATE INDEX IF NOT EXISTS idx_summaries_created ON episodic_summaries(created_at);

-- First sighting of each URL, for repost detection.
CREATE TABLE IF NOT EXISTS links (
    id          INTEGER PRIMARY KEY,
    url         TEXT NOT NULL,
    normalized  TEXT NOT NULL UNIQUE,
    author_id   TEXT NOT NULL DEFAULT '',
    author_name TEXT NOT NULL DEFAULT '',
    channel_id  TEXT NOT NULL DEFAULT '',
    message_url TEXT NOT NULL DEFAULT '',
    posted_at   INTEGER NOT NULL DEFAULT 0
);

-- Host substrings that never count as reposts.
CREATE TABLE IF NOT EXISTS link_exclusions (
    pattern TEXT PRIMARY KEY
);
"#;

/// Exclusion patterns seeded on first open: gif pickers and attachment
/// CDNs produce the same URLs constantly without anyone "reposting".
const SEED_EXCLUSIONS: &[&str] = &[
    "tenor.com",
    "giphy.com",
    "cdn.discordapp.com",
    "media.discordapp.net",
];

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times: all statements use `IF NOT EXISTS` and the
/// version/exclusion seeds use `INSERT OR IGNORE`.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    for pattern in SEED_EXCLUSIONS {
        conn.execute(
            "INSERT OR IGNORE INTO link_exclusions (pattern) VALUES (?1)",
            rusqlite::params![pattern],
        )?;
    }

    Ok(())
}

/// DDL for the vec0 KNN index tables (requires sqlite-vec loaded).
///
/// Each index is keyed by the base table's row id. The embedding BLOB on
/// the base row is the source of truth; these tables only serve
/// nearest-neighbor queries.
const VEC_SCHEMA_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS vec_user_facts USING vec0(
    fact_id INTEGER PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS vec_group_facts USING vec0(
    fact_id INTEGER PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS vec_summaries USING vec0(
    summary_id INTEGER PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Create the vec0 virtual tables.
///
/// Must be called **after** the sqlite-vec extension has been registered.
/// Safe to call multiple times (`IF NOT EXISTS`).
pub(crate) fn apply_vec_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(VEC_SCHEMA_SQL)
}

/// Read the stored schema version. `None` means the key is missing or
/// unparseable (a fresh or foreign database).
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    use rusqlite::OptionalExtension;

    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|v| v.parse().ok()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
