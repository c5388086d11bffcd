//! Background removal of expired records

use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Spawn a task that sweeps `registry` every `interval`
///
/// The first sweep happens one interval after spawning. Abort the returned
/// handle to stop sweeping.
pub fn spawn_sweeper(registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));
    info!("Sweeping expired tokens every {:?}", interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = registry.sweep_expired();
            if removed > 0 {
                debug!(removed, remaining = registry.len(), "Swept expired tokens");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ServiceRecord;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_records() {
        let registry = Arc::new(Registry::new(Duration::from_secs(2)));
        registry.add(ServiceRecord::new("host1", 9090)).unwrap();

        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.len(), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_aborted() {
        let registry = Arc::new(Registry::new(Duration::from_secs(1)));
        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(1));
        handle.abort();

        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());

        registry.add(ServiceRecord::new("host1", 9090)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.len(), 1);
    }
}
