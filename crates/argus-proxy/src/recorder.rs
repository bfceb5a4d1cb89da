//! Traffic recorder: commits completed transactions and publishes
//! statistics snapshots to live subscribers.

use std::sync::Arc;

use argus_core::{NewTrafficEntry, StatsUpdate, TrafficLogEntry, DEFAULT_RANGE_HOURS};
use argus_storage::{Database, StorageError};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

/// Buffered snapshots per subscriber before it starts lagging.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Shared handle that writes the traffic log and fans out `StatsUpdate`s.
#[derive(Clone)]
pub struct TrafficRecorder {
    db: Arc<Database>,
    updates: broadcast::Sender<StatsUpdate>,
    /// Serializes snapshot builds with their sends so subscribers never see
    /// totals go backwards.
    publish_lock: Arc<Mutex<()>>,
}

impl TrafficRecorder {
    pub fn new(db: Arc<Database>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            db,
            updates,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Subscribes to snapshots published after each committed transaction.
    pub fn subscribe(&self) -> broadcast::Receiver<StatsUpdate> {
        self.updates.subscribe()
    }

    /// Current dashboard snapshot.
    pub fn snapshot(&self) -> Result<StatsUpdate, StorageError> {
        self.db.stats_snapshot(DEFAULT_RANGE_HOURS, Utc::now())
    }

    /// Commits `entry` and publishes a snapshot if anyone is listening.
    ///
    /// Failures are logged and swallowed: the request path never fails
    /// because the log could not be written.
    pub async fn record(&self, entry: NewTrafficEntry) -> Option<TrafficLogEntry> {
        let db = self.db.clone();
        let committed =
            match tokio::task::spawn_blocking(move || db.record_transaction(entry)).await {
                Ok(Ok(committed)) => committed,
                Ok(Err(e)) => {
                    tracing::error!("Failed to record transaction: {}", e);
                    return None;
                }
                Err(e) => {
                    tracing::error!("Recorder task failed: {}", e);
                    return None;
                }
            };

        if self.updates.receiver_count() > 0 {
            self.publish().await;
        }

        Some(committed)
    }

    async fn publish(&self) {
        let _guard = self.publish_lock.lock().await;
        let recorder = self.clone();
        match tokio::task::spawn_blocking(move || recorder.snapshot()).await {
            Ok(Ok(update)) => {
                // Lagging receivers skip ahead; a send error only means
                // everyone unsubscribed meanwhile.
                let _ = self.updates.send(update);
            }
            Ok(Err(e)) => tracing::warn!("Failed to build stats snapshot: {}", e),
            Err(e) => tracing::warn!("Snapshot task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::Headers;
    use tokio_test::assert_ok;

    fn entry(url: &str) -> NewTrafficEntry {
        NewTrafficEntry::request("127.0.0.1", "GET", url, "good.com")
            .with_response(200, Headers::new(), None, 10)
    }

    #[tokio::test]
    async fn record_commits_entry() {
        let db = Arc::new(Database::in_memory().unwrap());
        let recorder = TrafficRecorder::new(db.clone());

        let committed = recorder.record(entry("http://good.com/")).await.unwrap();

        assert_eq!(db.get_traffic_entry(committed.id).unwrap(), committed);
        assert_eq!(recorder.snapshot().unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_update_per_transaction() {
        let recorder = TrafficRecorder::new(Arc::new(Database::in_memory().unwrap()));
        let mut rx = recorder.subscribe();

        recorder.record(entry("http://good.com/1")).await.unwrap();
        recorder.record(entry("http://good.com/2")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.total_requests, 1);
        assert_eq!(second.total_requests, 2);
        assert_eq!(second.recent_logs[0].url, "http://good.com/2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_publish_in_order() {
        let recorder = TrafficRecorder::new(Arc::new(Database::in_memory().unwrap()));
        let mut rx = recorder.subscribe();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    recorder
                        .record(entry(&format!("http://good.com/{}", i)))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut totals = Vec::new();
        for _ in 0..20 {
            totals.push(rx.recv().await.unwrap().total_requests);
        }
        assert!(totals.windows(2).all(|w| w[0] <= w[1]), "{:?}", totals);
        assert_eq!(totals.last(), Some(&20));
    }

    #[tokio::test]
    async fn record_without_subscribers() {
        let recorder = TrafficRecorder::new(Arc::new(Database::in_memory().unwrap()));
        assert!(recorder.record(entry("http://good.com/")).await.is_some());
        let snapshot = assert_ok!(recorder.snapshot());
        assert_eq!(snapshot.recent_logs.len(), 1);
    }
}
