//! SQL schema for the kiwatch SQLite store.

/// DDL statements, idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS targets (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        url           TEXT NOT NULL UNIQUE,
        last_swept_at TEXT
    )",
    // Rows are never deleted; only the triage columns change after insert.
    "CREATE TABLE IF NOT EXISTS observations (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        target_id      INTEGER NOT NULL REFERENCES targets(id),
        captured_at    TEXT NOT NULL,   -- RFC 3339 UTC, fixed width
        content        TEXT NOT NULL,   -- canonical payload JSON
        fingerprint    TEXT NOT NULL,
        classification TEXT,
        comment        TEXT,
        alert          INTEGER NOT NULL DEFAULT 0,
        UNIQUE (target_id, fingerprint)
    )",
    "CREATE INDEX IF NOT EXISTS observations_target_captured_idx
        ON observations(target_id, captured_at)",
    "CREATE INDEX IF NOT EXISTS observations_alert_idx ON observations(alert)",
];
