use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use super::health_monitor::{Liveness, StateFlusher};

/// Decide whether the main loop has stalled. Returns true once per stall: the
/// `tripped` latch is cleared when the heartbeat comes back.
pub fn heartbeat_expired(
    liveness: &Liveness,
    timeout: Duration,
    now: DateTime<Utc>,
    tripped: &mut bool,
) -> bool {
    let stalled = liveness.main_loop_age(now).is_some_and(|age| age > timeout);
    if !stalled {
        *tripped = false;
        return false;
    }
    if *tripped {
        return false;
    }
    *tripped = true;
    true
}

/// Last line of defence: persist everything when the main cycle stops beating.
pub async fn run_watchdog(
    liveness: Arc<Liveness>,
    flusher: Arc<dyn StateFlusher>,
    check_interval: Duration,
    heartbeat_timeout: Duration,
    mut running: watch::Receiver<bool>,
) {
    let mut timer = interval(check_interval);
    let mut tripped = false;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if heartbeat_expired(&liveness, heartbeat_timeout, Utc::now(), &mut tripped) {
                    tracing::error!(
                        timeout_secs = heartbeat_timeout.as_secs(),
                        "Main loop heartbeat lost, forcing emergency save"
                    );
                    flusher.flush_all().await;
                }
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
        }
    }
}
