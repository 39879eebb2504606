use crate::{api::AppState, policy, store};
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

/// Periodically reclaim rooms whose persisted expiry has passed. Lock
/// semantics are recomputed from event times on every request, so this only
/// releases storage.
pub fn spawn_purge_loop(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            let conn = match state.pool.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "housekeeping could not reach the pool");
                    continue;
                }
            };
            match store::purge_expired(&conn, policy::now_ms()) {
                Ok(0) => {}
                Ok(rooms) => info!(rooms, "purged expired chat rooms"),
                Err(e) => warn!(error = %e, "room purge failed"),
            }
        }
    });
}
