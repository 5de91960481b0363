#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use nephobot_core::{format_rfc3339, now_utc, KvStore, StorageFault};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const KV_MIGRATION_VERSION: i64 = 1;

const SCHEMA_KV_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kv_entries_key ON kv_entries(key);
";

/// Durable ordered key-value store over a single SQLite file.
///
/// WAL journaling plus a busy timeout make every committed `put` survive a
/// process crash; key ordering is the TEXT collation of the primary key, so
/// prefix scans come back sorted.
pub struct SqliteKvStore {
    conn: Connection,
}

impl SqliteKvStore {
    /// Opens (creating if needed) the store at `path`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or the pragmas fail.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Applies the schema. Idempotent; safe to call on every startup.
    ///
    /// # Errors
    /// Returns an error when schema statements fail.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_KV_V1)
            .context("failed to apply kv schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![KV_MIGRATION_VERSION, now],
            )
            .context("failed to register kv schema migration")?;

        Ok(())
    }
}

/// Smallest string strictly greater than every key with the given prefix, or
/// `None` when no such bound exists.
#[must_use]
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(bumped) = char::from_u32(u32::from(last) + 1) {
            chars.push(bumped);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn fault(op: &str, err: &dyn std::fmt::Display) -> StorageFault {
    StorageFault::new(op, err.to_string())
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageFault> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| fault("get", &err))?;

        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| StorageFault::new("get", format!("corrupt JSON at {key}: {err}"))),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<(), StorageFault> {
        let json = serde_json::to_string(value).map_err(|err| fault("put", &err))?;
        let now = format_rfc3339(now_utc()).map_err(|err| fault("put", &err))?;
        self.conn
            .execute(
                "INSERT INTO kv_entries(key, value_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![key, json, now],
            )
            .map_err(|err| fault("put", &err))?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StorageFault> {
        let removed = self
            .conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .map_err(|err| fault("delete", &err))?;
        Ok(removed > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageFault> {
        let mut entries: Vec<(String, String)> = Vec::new();

        if let Some(upper) = prefix_upper_bound(prefix) {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT key, value_json FROM kv_entries
                     WHERE key >= ?1 AND key < ?2
                     ORDER BY key ASC",
                )
                .map_err(|err| fault("scan", &err))?;
            let mut rows = stmt
                .query(params![prefix, upper])
                .map_err(|err| fault("scan", &err))?;
            while let Some(row) = rows.next().map_err(|err| fault("scan", &err))? {
                let key: String = row.get(0).map_err(|err| fault("scan", &err))?;
                let json: String = row.get(1).map_err(|err| fault("scan", &err))?;
                entries.push((key, json));
            }
        } else {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT key, value_json FROM kv_entries
                     WHERE key >= ?1
                     ORDER BY key ASC",
                )
                .map_err(|err| fault("scan", &err))?;
            let mut rows = stmt
                .query(params![prefix])
                .map_err(|err| fault("scan", &err))?;
            while let Some(row) = rows.next().map_err(|err| fault("scan", &err))? {
                let key: String = row.get(0).map_err(|err| fault("scan", &err))?;
                if !key.starts_with(prefix) {
                    break;
                }
                let json: String = row.get(1).map_err(|err| fault("scan", &err))?;
                entries.push((key, json));
            }
        }

        let mut decoded = Vec::with_capacity(entries.len());
        for (key, json) in entries {
            let value: Value = serde_json::from_str(&json)
                .map_err(|err| StorageFault::new("scan", format!("corrupt JSON at {key}: {err}")))?;
            decoded.push((key, value));
        }
        Ok(decoded)
    }
}
