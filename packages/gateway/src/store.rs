use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Well-known configuration keys.
pub mod keys {
    pub const SETUP_COMPLETE: &str = "setup_complete";
    pub const OAUTH_TOKEN: &str = "claude_oauth_token";
    pub const REFRESH_TOKEN: &str = "claude_refresh_token";
    pub const TOKEN_EXPIRES_AT: &str = "claude_token_expires_at";
    pub const TOKEN_REFRESHED_AT: &str = "claude_token_refreshed_at";
    pub const OAUTH_PENDING_STATE: &str = "oauth_pending_state";
    pub const OAUTH_PENDING_VERIFIER: &str = "oauth_pending_verifier";
    pub const IDENTITY_PENDING_STATE: &str = "identity_pending_state";
    pub const VAULT_LAST_PUSH: &str = "vault_last_push";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: String,
    pub turn_count: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub sessions: u64,
    pub turns: u64,
    pub cost_usd: f64,
}

/// SQLite-backed key-value config plus session history.
///
/// Uses a `Mutex<Connection>` for thread-safe interior mutability; each call
/// is a single statement, so writes serialize and reads stay consistent.
pub struct ConfigStore {
    conn: Mutex<Connection>,
}

impl ConfigStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id         TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at   TEXT,
                status     TEXT NOT NULL,
                turn_count INTEGER NOT NULL DEFAULT 0,
                cost_usd   REAL NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn create_session(&self, id: &str, started_at: OffsetDateTime) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO sessions (id, started_at, status) VALUES (?1, ?2, ?3)",
            params![id, rfc3339(started_at), SessionStatus::Running.as_str()],
        )?;
        Ok(())
    }

    pub fn record_turn(&self, id: &str, turn_count: u64, cost_usd: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "UPDATE sessions SET turn_count = ?2, cost_usd = ?3 WHERE id = ?1",
            params![id, turn_count as i64, cost_usd],
        )?;
        Ok(())
    }

    pub fn finish_session(
        &self,
        id: &str,
        ended_at: OffsetDateTime,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "UPDATE sessions SET ended_at = ?2, status = ?3 WHERE id = ?1",
            params![id, rfc3339(ended_at), status.as_str()],
        )?;
        Ok(())
    }

    pub fn session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let record = conn
            .query_row(
                "SELECT id, started_at, ended_at, status, turn_count, cost_usd
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                        status: row.get(3)?,
                        turn_count: row.get::<_, i64>(4)? as u64,
                        cost_usd: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn usage_totals(&self) -> Result<UsageTotals, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let totals = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(turn_count), 0), COALESCE(SUM(cost_usd), 0)
             FROM sessions",
            [],
            |row| {
                Ok(UsageTotals {
                    sessions: row.get::<_, i64>(0)? as u64,
                    turns: row.get::<_, i64>(1)? as u64,
                    cost_usd: row.get(2)?,
                })
            },
        )?;
        Ok(totals)
    }
}

fn rfc3339(instant: OffsetDateTime) -> String {
    instant
        .format(&Rfc3339)
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_previous_value() {
        let store = ConfigStore::open_memory().unwrap();
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn delete_then_get_returns_none() {
        let store = ConfigStore::open_memory().unwrap();
        store.set("k", "v").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn session_lifecycle_round_trip() {
        let store = ConfigStore::open_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        store.create_session("s1", now).unwrap();
        store.record_turn("s1", 2, 0.05).unwrap();
        store.finish_session("s1", now, SessionStatus::Stopped).unwrap();

        let record = store.session("s1").unwrap().unwrap();
        assert_eq!(record.status, "stopped");
        assert_eq!(record.turn_count, 2);
        assert!(record.ended_at.is_some());
        assert!((record.cost_usd - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_totals_sum_across_sessions() {
        let store = ConfigStore::open_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        store.create_session("a", now).unwrap();
        store.create_session("b", now).unwrap();
        store.record_turn("a", 1, 0.01).unwrap();
        store.record_turn("b", 3, 0.04).unwrap();

        let totals = store.usage_totals().unwrap();
        assert_eq!(totals.sessions, 2);
        assert_eq!(totals.turns, 4);
        assert!((totals.cost_usd - 0.05).abs() < 1e-9);
    }
}
