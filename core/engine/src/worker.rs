use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::metrics::LearningMetrics;

/// Background worker that computes learning snapshots on a fixed cadence
pub struct SnapshotWorker {
    metrics: Arc<LearningMetrics>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Handle used to stop a running `SnapshotWorker`.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker and wait for it to finish its current snapshot.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Snapshot worker ended abnormally: {}", e);
        }
    }
}

impl SnapshotWorker {
    pub fn new(
        metrics: Arc<LearningMetrics>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            metrics,
            interval,
            shutdown,
        }
    }

    /// Spawn a worker on the current runtime.
    pub fn spawn(metrics: Arc<LearningMetrics>, interval: Duration) -> WorkerHandle {
        let (tx, rx) = watch::channel(false);
        let worker = Self::new(metrics, interval, rx);
        WorkerHandle {
            shutdown: tx,
            task: tokio::spawn(worker.run()),
        }
    }

    /// Run until shutdown is signalled or the sender is dropped.
    pub async fn run(mut self) {
        info!("Snapshot worker started (every {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.snapshot_once().await,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        warn!("Snapshot worker stopped");
    }

    async fn snapshot_once(&self) {
        let metrics = self.metrics.clone();
        match tokio::task::spawn_blocking(move || metrics.compute_snapshot()).await {
            Ok(Ok(snapshot)) => info!(
                "Periodic snapshot: accuracy {:.1}%, improvement {:.3}",
                snapshot.accuracy_rate, snapshot.improvement_score
            ),
            Ok(Err(e)) => error!("Failed to compute snapshot: {}", e),
            Err(e) => error!("Snapshot task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FeedbackLedger;
    use crate::weights::WeightStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_worker_snapshots_until_stopped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("para.db");
        let ledger = Arc::new(FeedbackLedger::open(&path, Duration::from_millis(1)).unwrap());
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let metrics = Arc::new(LearningMetrics::open(&path, ledger, store, None, 10).unwrap());

        let handle = SnapshotWorker::spawn(metrics.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let taken = metrics.snapshot_count().unwrap();
        assert!(taken >= 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(metrics.snapshot_count().unwrap(), taken);
    }
}
