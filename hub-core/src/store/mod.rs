//! Repository abstraction over the persisted state (agents, tasks,
//! transactions). The hub's runtime components depend only on these traits;
//! [`sqlite`] is the production implementation, [`memory`] backs unit tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub hostname: String,
    pub version: String,
    pub remote_addr: String,
    pub status: AgentStatus,
    pub last_seen: i64,
    pub user_id: i64,
    pub bound: bool,
    pub hardware_fingerprint: Option<Value>,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub action: String,
    pub agent_id: String,
    pub user_id: i64,
    pub payload: String,
}

/// Operations the Connection Hub and Binding Store need against the agent
/// table. `&self` rather than `&mut self` throughout: every implementation
/// is internally synchronised (a pooled sqlite connection or a mutex'd map)
/// so the trait can be shared behind a plain `Arc`.
pub trait AgentRepository: Send + Sync {
    fn upsert_heartbeat(
        &self,
        id: &str,
        hostname: &str,
        version: &str,
        remote_addr: &str,
        hardware_fingerprint: Option<Value>,
        now: i64,
    ) -> Result<()>;

    fn mark_status(&self, id: &str, status: AgentStatus) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<AgentRecord>>;

    fn bind_owner(&self, id: &str, user_id: i64) -> Result<()>;

    /// First agent id with `status = online` owned by `user_id`, if any.
    fn first_online_for_user(&self, user_id: i64) -> Result<Option<String>>;

    /// `(agent_id, user_id)` pairs with `status = online`, `user_id > 0`,
    /// and `last_seen > now - active_window_secs`.
    fn active_for_mining(&self, now: i64, active_window_secs: i64) -> Result<Vec<(String, i64)>>;
}

/// Operations against tasks, users, and transactions — the ledger side of
/// the store.
pub trait LedgerRepository: Send + Sync {
    fn create_task(&self, task: NewTask) -> Result<i64>;

    fn update_task_result(
        &self,
        task_id: i64,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Atomically debits `amount` credits from `user_id`; fails if the
    /// balance would go negative.
    fn debit_credits(&self, user_id: i64, amount: i64) -> Result<(), InsufficientCredits>;

    /// Credits `amount` back to `user_id` and appends a transaction row.
    /// Best-effort per spec (I/O failure here is logged, not propagated as
    /// an RPC-visible error), but returns `Result` so callers can log it.
    fn credit(
        &self,
        user_id: i64,
        amount: i64,
        kind: &str,
        description: &str,
        related_id: Option<i64>,
    ) -> Result<()>;

    fn balance(&self, user_id: i64) -> Result<i64>;

    fn cleanup_old_transactions(&self, older_than_days: i64) -> Result<u64>;
}

#[derive(Debug, thiserror::Error)]
#[error("insufficient credits")]
pub struct InsufficientCredits;
