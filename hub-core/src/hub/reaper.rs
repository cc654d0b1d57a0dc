//! Stale connection reaper: periodically evicts connections that have gone
//! quiet past the configured threshold without relying on the read loop or
//! ping loop noticing first.
//!
//! Grounded on `hub_server/ws/hub.go`'s housekeeping goroutine. The teacher
//! posts every mutation through `Unregister`; here the reaper takes the
//! registry lock directly to scan for staleness (cheap, read-only) and then
//! still funnels the actual removal through the same `unregister` channel
//! the read loop and ping loop use, keyed by connection identity so a
//! reaped connection never clobbers one that already supplanted it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::registry::{ConnectionLike, Registry};

const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run<C: ConnectionLike>(
    registry: Arc<Registry<C>>,
    stale_threshold: Duration,
    unregister: mpsc::Sender<Arc<C>>,
    mut now: impl FnMut() -> i64 + Send + 'static,
) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let cutoff = now() - stale_threshold.as_secs() as i64;
        let stale = registry.ids_stale_since(cutoff);
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "reaping stale connections");
        }
        for id in stale {
            if let Some(conn) = registry.get(&id) {
                conn.close();
                let _ = unregister.send(conn).await;
            }
        }
    }
}
