use std::path::Path;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

/// Open (creating if needed) the local state database.
pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            run_key    TEXT PRIMARY KEY,
            last_page  INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS dead_letters (
            id         INTEGER PRIMARY KEY,
            kind       TEXT NOT NULL CHECK(kind IN ('page','insert')),
            page       INTEGER,
            name       TEXT,
            source_url TEXT,
            payload    TEXT,
            error      TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_dead_letters_kind ON dead_letters(kind);

        -- Used by the local store backend
        CREATE TABLE IF NOT EXISTS companies (
            id          INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            source_url  TEXT NOT NULL,
            description TEXT,
            location    TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_companies_name ON companies(name);
        ",
    )
}

// ── Checkpoint ──

/// Key under which the harvest of the listing site records its progress.
pub const LISTING_RUN_KEY: &str = "listing";

pub fn load_checkpoint(conn: &Connection, run_key: &str) -> Result<Option<u32>> {
    let page = conn
        .query_row(
            "SELECT last_page FROM checkpoints WHERE run_key = ?1",
            [run_key],
            |row| row.get::<_, u32>(0),
        )
        .optional()?;
    Ok(page)
}

/// Single upsert, so the checkpoint is either the old page or the new one.
pub fn save_checkpoint(conn: &Connection, run_key: &str, last_page: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (run_key, last_page, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(run_key) DO UPDATE SET last_page = excluded.last_page,
                                            updated_at = excluded.updated_at",
        rusqlite::params![run_key, last_page],
    )?;
    Ok(())
}

// ── Dead letters ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterKind {
    Page,
    Insert,
}

impl DeadLetterKind {
    fn as_str(self) -> &'static str {
        match self {
            DeadLetterKind::Page => "page",
            DeadLetterKind::Insert => "insert",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub page: Option<u32>,
    pub name: Option<String>,
    pub source_url: Option<String>,
    /// Record JSON for failed inserts.
    pub payload: Option<String>,
    pub error: String,
}

pub fn record_failed_page(conn: &Connection, page: u32, error: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO dead_letters (kind, page, error) VALUES (?1, ?2, ?3)",
        rusqlite::params![DeadLetterKind::Page.as_str(), page, error],
    )?;
    Ok(())
}

pub fn record_failed_insert(
    conn: &Connection,
    name: &str,
    source_url: &str,
    payload: &str,
    error: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO dead_letters (kind, name, source_url, payload, error)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![DeadLetterKind::Insert.as_str(), name, source_url, payload, error],
    )?;
    Ok(())
}

pub fn fetch_dead_letters(conn: &Connection, kind: DeadLetterKind) -> Result<Vec<DeadLetter>> {
    let mut stmt = conn.prepare(
        "SELECT id, page, name, source_url, payload, error
         FROM dead_letters WHERE kind = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([kind.as_str()], |row| {
            Ok(DeadLetter {
                id: row.get(0)?,
                page: row.get(1)?,
                name: row.get(2)?,
                source_url: row.get(3)?,
                payload: row.get(4)?,
                error: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_dead_letter(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])?;
    Ok(())
}

pub fn count_dead_letters(conn: &Connection) -> Result<(usize, usize)> {
    let count = |kind: DeadLetterKind| -> rusqlite::Result<usize> {
        conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
    };
    Ok((count(DeadLetterKind::Page)?, count(DeadLetterKind::Insert)?))
}
