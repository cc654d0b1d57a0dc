//! In-memory repository fake used by unit tests for the hub, mediator, and
//! mining scheduler — same trait surface as [`super::sqlite::SqliteStore`]
//! without touching disk.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;

use super::{AgentRecord, AgentRepository, AgentStatus, InsufficientCredits, LedgerRepository, NewTask, TaskStatus};

#[derive(Default)]
struct TaskRow {
    status: TaskStatus,
    #[allow(dead_code)]
    agent_id: String,
    #[allow(dead_code)]
    user_id: i64,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub user_id: i64,
    pub amount: i64,
    pub kind: String,
}

#[derive(Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<String, AgentRecord>>,
    tasks: Mutex<Vec<TaskRow>>,
    balances: Mutex<HashMap<i64, i64>>,
    transactions: Mutex<Vec<TransactionRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentRepository for MemoryStore {
    fn upsert_heartbeat(
        &self,
        id: &str,
        hostname: &str,
        version: &str,
        remote_addr: &str,
        hardware_fingerprint: Option<Value>,
        now: i64,
    ) -> Result<()> {
        let mut agents = self.agents.lock();
        let entry = agents.entry(id.to_string()).or_insert_with(|| AgentRecord {
            id: id.to_string(),
            hostname: String::new(),
            version: String::new(),
            remote_addr: String::new(),
            status: AgentStatus::Offline,
            last_seen: 0,
            user_id: 0,
            bound: false,
            hardware_fingerprint: None,
            display_name: None,
            group: None,
            locked: false,
        });
        entry.hostname = hostname.to_string();
        entry.version = version.to_string();
        entry.remote_addr = remote_addr.to_string();
        entry.status = AgentStatus::Online;
        entry.last_seen = now;
        if hardware_fingerprint.is_some() {
            entry.hardware_fingerprint = hardware_fingerprint;
        }
        Ok(())
    }

    fn mark_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        if let Some(agent) = self.agents.lock().get_mut(id) {
            agent.status = status;
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.agents.lock().get(id).cloned())
    }

    fn bind_owner(&self, id: &str, user_id: i64) -> Result<()> {
        if let Some(agent) = self.agents.lock().get_mut(id) {
            agent.user_id = user_id;
            agent.bound = true;
        }
        Ok(())
    }

    fn first_online_for_user(&self, user_id: i64) -> Result<Option<String>> {
        let agents = self.agents.lock();
        let mut matches: Vec<&AgentRecord> = agents
            .values()
            .filter(|a| a.user_id == user_id && a.status == AgentStatus::Online)
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches.first().map(|a| a.id.clone()))
    }

    fn active_for_mining(&self, now: i64, active_window_secs: i64) -> Result<Vec<(String, i64)>> {
        let cutoff = now - active_window_secs;
        let agents = self.agents.lock();
        let mut out: Vec<(String, i64)> = agents
            .values()
            .filter(|a| a.status == AgentStatus::Online && a.user_id > 0 && a.last_seen > cutoff)
            .map(|a| (a.id.clone(), a.user_id))
            .collect();
        out.sort();
        Ok(out)
    }
}

impl LedgerRepository for MemoryStore {
    fn create_task(&self, task: NewTask) -> Result<i64> {
        let mut tasks = self.tasks.lock();
        tasks.push(TaskRow {
            status: TaskStatus::Pending,
            agent_id: task.agent_id,
            user_id: task.user_id,
        });
        Ok((tasks.len() - 1) as i64)
    }

    fn update_task_result(
        &self,
        task_id: i64,
        status: TaskStatus,
        _result: Option<&str>,
        _error: Option<&str>,
    ) -> Result<()> {
        if let Some(row) = self.tasks.lock().get_mut(task_id as usize) {
            row.status = status;
        }
        Ok(())
    }

    fn debit_credits(&self, user_id: i64, amount: i64) -> Result<(), InsufficientCredits> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(user_id).or_insert(0);
        if *balance < amount {
            return Err(InsufficientCredits);
        }
        *balance -= amount;
        drop(balances);
        self.transactions.lock().push(TransactionRow { user_id, amount: -amount, kind: "charge".into() });
        Ok(())
    }

    fn credit(
        &self,
        user_id: i64,
        amount: i64,
        kind: &str,
        _description: &str,
        _related_id: Option<i64>,
    ) -> Result<()> {
        let mut balances = self.balances.lock();
        *balances.entry(user_id).or_insert(0) += amount;
        drop(balances);
        self.transactions.lock().push(TransactionRow { user_id, amount, kind: kind.to_string() });
        Ok(())
    }

    fn balance(&self, user_id: i64) -> Result<i64> {
        Ok(*self.balances.lock().get(&user_id).unwrap_or(&0))
    }

    fn cleanup_old_transactions(&self, _older_than_days: i64) -> Result<u64> {
        Ok(0)
    }
}
