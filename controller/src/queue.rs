//! A rate-limited work queue keyed by node name: each key gets up to
//! [`MAX_RETRIES`] re-enqueues after a reconciliation error before it is
//! dropped and logged. A later event for the same key re-admits it with a
//! fresh retry budget.

use std::collections::HashMap;

use tokio::sync::mpsc;

pub const MAX_RETRIES: u8 = 5;

pub struct WorkQueue {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    retries: HashMap<String, u8>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx, retries: HashMap::new() }
    }

    pub fn handle(&self) -> WorkQueueHandle {
        WorkQueueHandle { tx: self.tx.clone() }
    }

    /// Waits for the next key to process, resetting its retry budget (a
    /// fresh event always re-admits the key).
    pub async fn recv(&mut self) -> Option<String> {
        let key = self.rx.recv().await?;
        self.retries.remove(&key);
        Some(key)
    }

    /// Call after a failed reconciliation for `key`. Returns `true` if the
    /// key was re-enqueued, `false` if its retry budget was exhausted (in
    /// which case the caller should log and drop it).
    pub async fn retry(&mut self, key: String) -> bool {
        let attempts = self.retries.entry(key.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > MAX_RETRIES {
            self.retries.remove(&key);
            return false;
        }
        // A full channel must not block the enqueuer; the caller is this
        // queue's own consumer, so a dropped retry here would deadlock.
        let _ = self.tx.try_send(key);
        true
    }
}

#[derive(Clone)]
pub struct WorkQueueHandle {
    tx: mpsc::Sender<String>,
}

impl WorkQueueHandle {
    pub async fn enqueue(&self, key: String) {
        let _ = self.tx.send(key).await;
    }
}
