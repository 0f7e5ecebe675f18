use std::collections::HashMap;

use common::storage::types::job::ProgressCounters;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

/// Broadcast buffer per job; a subscriber that falls further behind than
/// this skips ahead rather than blocking the worker.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: String,
    pub stage: String,
    pub percent: u8,
    pub counters: ProgressCounters,
    pub message: Option<String>,
    /// Monotone per job; doubles as the SSE event id for reconnects.
    pub sequence: u64,
}

struct JobChannel {
    snapshot: ProgressEvent,
    tx: broadcast::Sender<ProgressEvent>,
}

/// Fan-out hub between workers and stream subscribers. Workers push events;
/// subscribers join at any time and receive the last snapshot followed by
/// live deltas. Dropping or lagging subscribers never block a worker.
#[derive(Default)]
pub struct ProgressHub {
    inner: RwLock<HashMap<String, JobChannel>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event for a job, assigning the next sequence number.
    pub async fn publish(&self, mut event: ProgressEvent) {
        let mut inner = self.inner.write().await;
        match inner.get_mut(&event.job_id) {
            Some(channel) => {
                event.sequence = channel.snapshot.sequence.saturating_add(1);
                channel.snapshot = event.clone();
                // Send fails only when nobody is listening, which is fine.
                let _ = channel.tx.send(event);
            }
            None => {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                event.sequence = 1;
                inner.insert(
                    event.job_id.clone(),
                    JobChannel {
                        snapshot: event.clone(),
                        tx,
                    },
                );
            }
        }
    }

    /// Join the stream for a job: last-known snapshot plus a live receiver.
    pub async fn subscribe(
        &self,
        job_id: &str,
    ) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let mut inner = self.inner.write().await;
        let channel = inner.entry(job_id.to_owned()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            JobChannel {
                snapshot: ProgressEvent {
                    job_id: job_id.to_owned(),
                    status: "unknown".into(),
                    stage: "pending".into(),
                    percent: 0,
                    counters: ProgressCounters::default(),
                    message: None,
                    sequence: 0,
                },
                tx,
            }
        });

        let snapshot = (channel.snapshot.sequence > 0).then(|| channel.snapshot.clone());
        (snapshot, channel.tx.subscribe())
    }

    /// Drop a job's channel once its retention has expired.
    pub async fn forget(&self, job_id: &str) {
        self.inner.write().await.remove(job_id);
    }
}
