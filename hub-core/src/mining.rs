//! Mining Scheduler: credits users for keeping agents online, and keeps the
//! transaction table bounded.
//!
//! Grounded on `hub_server/services/mining.go`: a 60s accrual tick over
//! `GetActiveNodes(90s)` grouped by owner, crediting `count(active_devices)`
//! per user in one transaction each; a separate 60-minute pruning tick
//! (also run once at startup) deleting `mining` transactions older than 7
//! days.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::store::LedgerRepository;
use crate::store::AgentRepository;

const ACCRUAL_INTERVAL: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const ACTIVE_WINDOW_SECS: i64 = 90;
const TRANSACTION_RETENTION_DAYS: i64 = 7;

pub async fn run_accrual(
    agents: Arc<dyn AgentRepository>,
    ledger: Arc<dyn LedgerRepository>,
    mut now: impl FnMut() -> i64 + Send + 'static,
) {
    let mut interval = tokio::time::interval(ACCRUAL_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = accrue_once(&*agents, &*ledger, now()) {
            tracing::error!(error = %e, "mining accrual tick failed to list active agents");
        }
    }
}

pub async fn run_pruning(ledger: Arc<dyn LedgerRepository>) {
    prune_once(&*ledger);
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        interval.tick().await;
        prune_once(&*ledger);
    }
}

fn accrue_once(agents: &dyn AgentRepository, ledger: &dyn LedgerRepository, now: i64) -> anyhow::Result<()> {
    let active = agents.active_for_mining(now, ACTIVE_WINDOW_SECS)?;

    let mut by_user: HashMap<i64, i64> = HashMap::new();
    for (_agent_id, user_id) in active {
        *by_user.entry(user_id).or_insert(0) += 1;
    }

    for (user_id, device_count) in by_user {
        if let Err(e) = ledger.credit(
            user_id,
            device_count,
            "mining",
            &format!("{device_count} active device(s)"),
            None,
        ) {
            tracing::error!(user_id, error = %e, "failed to credit mining reward, continuing tick");
        }
    }

    Ok(())
}

fn prune_once(ledger: &dyn LedgerRepository) {
    match ledger.cleanup_old_transactions(TRANSACTION_RETENTION_DAYS) {
        Ok(deleted) if deleted > 0 => {
            tracing::info!(deleted, "pruned old mining transactions");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "mining transaction pruning failed"),
    }
}
