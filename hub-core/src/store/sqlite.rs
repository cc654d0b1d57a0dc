//! Embedded SQLite-backed repository: WAL journaling, a 5000ms busy
//! timeout, and a single shared connection (the spec caps the store at one
//! writer) guarded by a mutex, mirroring the reference's single
//! `gorm.DB` handle over `github.com/glebarez/sqlite`.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{AgentRecord, AgentRepository, AgentStatus, InsufficientCredits, LedgerRepository, NewTask, TaskStatus};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening sqlite db at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id                   TEXT PRIMARY KEY,
                hostname             TEXT NOT NULL DEFAULT '',
                version              TEXT NOT NULL DEFAULT '',
                remote_addr          TEXT NOT NULL DEFAULT '',
                status               TEXT NOT NULL DEFAULT 'offline',
                last_seen            INTEGER NOT NULL DEFAULT 0,
                user_id              INTEGER NOT NULL DEFAULT 0,
                bound                INTEGER NOT NULL DEFAULT 0,
                hardware_fingerprint TEXT,
                display_name         TEXT,
                grp                  TEXT,
                locked               INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                type        TEXT NOT NULL,
                agent_id    TEXT NOT NULL,
                user_id     INTEGER NOT NULL,
                payload     TEXT NOT NULL,
                status      TEXT NOT NULL,
                result      TEXT,
                error       TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id      INTEGER PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL,
                amount      INTEGER NOT NULL,
                type        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                related_id  INTEGER,
                created_at  INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentRecord> {
    let status: String = row.get("status")?;
    let fingerprint: Option<String> = row.get("hardware_fingerprint")?;
    Ok(AgentRecord {
        id: row.get("id")?,
        hostname: row.get("hostname")?,
        version: row.get("version")?,
        remote_addr: row.get("remote_addr")?,
        status: if status == "online" {
            AgentStatus::Online
        } else {
            AgentStatus::Offline
        },
        last_seen: row.get("last_seen")?,
        user_id: row.get("user_id")?,
        bound: row.get::<_, i64>("bound")? != 0,
        hardware_fingerprint: fingerprint.and_then(|s| serde_json::from_str(&s).ok()),
        display_name: row.get("display_name")?,
        group: row.get("grp")?,
        locked: row.get::<_, i64>("locked")? != 0,
    })
}

impl AgentRepository for SqliteStore {
    fn upsert_heartbeat(
        &self,
        id: &str,
        hostname: &str,
        version: &str,
        remote_addr: &str,
        hardware_fingerprint: Option<Value>,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let fp = hardware_fingerprint.map(|v| v.to_string());
        conn.execute(
            r#"
            INSERT INTO agents (id, hostname, version, remote_addr, status, last_seen, hardware_fingerprint)
            VALUES (?1, ?2, ?3, ?4, 'online', ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                version = excluded.version,
                remote_addr = excluded.remote_addr,
                status = 'online',
                last_seen = excluded.last_seen,
                hardware_fingerprint = COALESCE(excluded.hardware_fingerprint, agents.hardware_fingerprint)
            "#,
            params![id, hostname, version, remote_addr, now, fp],
        )?;
        Ok(())
    }

    fn mark_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock();
        let agent = conn
            .query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
            .optional()?;
        Ok(agent)
    }

    fn bind_owner(&self, id: &str, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET user_id = ?1, bound = 1 WHERE id = ?2",
            params![user_id, id],
        )?;
        Ok(())
    }

    fn first_online_for_user(&self, user_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM agents WHERE user_id = ?1 AND status = 'online' ORDER BY id LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn active_for_mining(&self, now: i64, active_window_secs: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let cutoff = now - active_window_secs;
        let mut stmt = conn.prepare(
            "SELECT id, user_id FROM agents WHERE status = 'online' AND user_id > 0 AND last_seen > ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl LedgerRepository for SqliteStore {
    fn create_task(&self, task: NewTask) -> Result<i64> {
        let conn = self.conn.lock();
        let now = Self::now();
        conn.execute(
            r#"
            INSERT INTO tasks (type, agent_id, user_id, payload, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
            "#,
            params![task.action, task.agent_id, task.user_id, task.payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_task_result(
        &self,
        task_id: i64,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE tasks SET status = ?1, result = ?2, error = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
            params![status.as_str(), result, error, Self::now(), task_id],
        )?;
        Ok(())
    }

    fn debit_credits(&self, user_id: i64, amount: i64) -> Result<(), InsufficientCredits> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, balance) VALUES (?1, 0) ON CONFLICT(id) DO NOTHING",
            params![user_id],
        )
        .map_err(|_| InsufficientCredits)?;

        let changed = conn
            .execute(
                "UPDATE users SET balance = balance - ?1 WHERE id = ?2 AND balance >= ?1",
                params![amount, user_id],
            )
            .map_err(|_| InsufficientCredits)?;

        if changed == 0 {
            return Err(InsufficientCredits);
        }

        conn.execute(
            r#"
            INSERT INTO transactions (user_id, amount, type, description, related_id, created_at)
            VALUES (?1, ?2, 'charge', '', NULL, ?3)
            "#,
            params![user_id, -amount, Self::now()],
        )
        .map_err(|_| InsufficientCredits)?;

        Ok(())
    }

    fn credit(
        &self,
        user_id: i64,
        amount: i64,
        kind: &str,
        description: &str,
        related_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, balance) VALUES (?1, 0) ON CONFLICT(id) DO NOTHING",
            params![user_id],
        )?;
        conn.execute(
            "UPDATE users SET balance = balance + ?1 WHERE id = ?2",
            params![amount, user_id],
        )?;
        conn.execute(
            r#"
            INSERT INTO transactions (user_id, amount, type, description, related_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![user_id, amount, kind, description, related_id, Self::now()],
        )?;
        Ok(())
    }

    fn balance(&self, user_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let balance = conn
            .query_row(
                "SELECT balance FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(balance)
    }

    fn cleanup_old_transactions(&self, older_than_days: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let cutoff = Self::now() - older_than_days * 86_400;
        let deleted = conn.execute("DELETE FROM transactions WHERE created_at < ?1", params![cutoff])?;
        Ok(deleted as u64)
    }
}
