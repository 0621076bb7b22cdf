//! Idempotent DDL for the `SQLite` state store.

/// Creates every state table if missing. Safe to run on each open.
pub const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS relay_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    events_read INTEGER DEFAULT 0,
    events_applied INTEGER DEFAULT 0,
    events_skipped INTEGER DEFAULT 0,
    dead_lettered INTEGER DEFAULT 0,
    retries INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dedup_index (
    pipeline TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    source_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    destination_id TEXT,
    applied INTEGER NOT NULL,
    reason TEXT,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, dedup_key)
);

CREATE TABLE IF NOT EXISTS applied_sequences (
    pipeline TEXT NOT NULL,
    source_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, source_id)
);

CREATE TABLE IF NOT EXISTS natural_keys (
    pipeline TEXT NOT NULL,
    entity TEXT NOT NULL,
    source_id TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    PRIMARY KEY (pipeline, entity, source_id)
);

CREATE TABLE IF NOT EXISTS apply_journal (
    pipeline TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    source_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    PRIMARY KEY (pipeline, dedup_key)
);

CREATE TABLE IF NOT EXISTS correlations (
    pipeline TEXT NOT NULL,
    source_id TEXT NOT NULL,
    destination_id TEXT NOT NULL,
    applied_sequence INTEGER NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, source_id)
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES relay_runs(id),
    source_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    stage TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    error_code TEXT NOT NULL,
    error_message TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    replayed_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_pipeline ON dead_letters (pipeline, replayed_at);
";
