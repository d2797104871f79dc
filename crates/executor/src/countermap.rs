use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

enum Msg {
    Get(String, oneshot::Sender<(i64, bool)>),
    Set(String, i64),
    Inc(String, i64),
    Dec(String, i64),
    Delete(String),
    Stop,
}

/// Tracks signed counter values for unique keys.
///
/// All state lives inside a single owner task; mutations are messages and
/// reads are request/response. That serializes every read-modify-write
/// without a lock shared with callers.
///
/// `inc`/`dec` on a missing key create it with `±amount`; callers rely on
/// `inc` always succeeding and a following `get` seeing the new value.
#[derive(Clone)]
pub struct Counter {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Counter {
    /// Creates the counter and spawns its owner task.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(handler(rx));
        Self { tx }
    }

    /// Returns the current value for the key and whether it exists.
    /// A missing key reads as `(0, false)`.
    pub async fn get(&self, key: &str) -> (i64, bool) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Get(key.to_string(), reply_tx)).is_ok() {
            if let Ok(answer) = reply_rx.await {
                return answer;
            }
        }
        // A stopped owner never answers; park the caller with it.
        std::future::pending().await
    }

    pub fn inc(&self, key: &str) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&self, key: &str, amount: i64) {
        let _ = self.tx.send(Msg::Inc(key.to_string(), amount));
    }

    pub fn dec(&self, key: &str) {
        self.dec_by(key, 1);
    }

    pub fn dec_by(&self, key: &str, amount: i64) {
        let _ = self.tx.send(Msg::Dec(key.to_string(), amount));
    }

    pub fn set(&self, key: &str, value: i64) {
        let _ = self.tx.send(Msg::Set(key.to_string(), value));
    }

    /// Sets the counter to zero; the key is retained.
    pub fn reset(&self, key: &str) {
        self.set(key, 0);
    }

    pub fn delete(&self, key: &str) {
        let _ = self.tx.send(Msg::Delete(key.to_string()));
    }

    /// Stops the owner from servicing requests. Meant for shutdown only:
    /// afterwards nothing is acted on or answered, so callers that keep
    /// using the counter block forever.
    pub fn stop(&self) {
        let _ = self.tx.send(Msg::Stop);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

async fn handler(mut rx: mpsc::UnboundedReceiver<Msg>) {
    let mut counts: HashMap<String, i64> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Get(key, reply) => {
                let answer = match counts.get(&key) {
                    Some(v) => (*v, true),
                    None => (0, false),
                };
                let _ = reply.send(answer);
            }
            Msg::Set(key, value) => {
                counts.insert(key, value);
            }
            Msg::Inc(key, amount) => {
                *counts.entry(key).or_insert(0) += amount;
            }
            Msg::Dec(key, amount) => {
                *counts.entry(key).or_insert(0) -= amount;
            }
            Msg::Delete(key) => {
                counts.remove(&key);
            }
            Msg::Stop => {
                // Keep holding the receiver without reading it: senders stay
                // connected, queued requests are never serviced, and reply
                // handles are never resolved.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sends are processed in order by the owner task, so a get after a
    // mutation observes it.

    #[tokio::test]
    async fn missing_key_reads_as_zero_and_absent() {
        let counter = Counter::new();
        assert_eq!(counter.get("nope").await, (0, false));
    }

    #[tokio::test]
    async fn inc_on_missing_key_creates_it() {
        let counter = Counter::new();
        counter.inc("boop");
        assert_eq!(counter.get("boop").await, (1, true));
        counter.inc_by("boop", 10);
        assert_eq!(counter.get("boop").await, (11, true));
    }

    #[tokio::test]
    async fn dec_on_missing_key_creates_it_negative() {
        let counter = Counter::new();
        counter.dec("boop");
        assert_eq!(counter.get("boop").await, (-1, true));
        counter.dec_by("boop", 4);
        assert_eq!(counter.get("boop").await, (-5, true));
    }

    #[tokio::test]
    async fn inc_then_dec_restores_the_value() {
        let counter = Counter::new();
        counter.set("boop", 7);
        counter.inc("boop");
        counter.dec("boop");
        assert_eq!(counter.get("boop").await, (7, true));
    }

    #[tokio::test]
    async fn reset_keeps_the_key() {
        let counter = Counter::new();
        counter.inc_by("boop", 3);
        counter.reset("boop");
        assert_eq!(counter.get("boop").await, (0, true));
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let counter = Counter::new();
        counter.set("boop", 3);
        counter.delete("boop");
        assert_eq!(counter.get("boop").await, (0, false));
    }

    #[tokio::test]
    async fn stop_blocks_subsequent_operations() {
        let counter = Counter::new();
        counter.set("boop", 3);
        counter.stop();
        counter.inc("boop");
        // The owner processes in order, so the stop lands after the set;
        // from then on reads never resolve.
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), counter.get("boop")).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let counter = Counter::new();
        let other = counter.clone();
        counter.inc("boop");
        assert_eq!(other.get("boop").await, (1, true));
    }
}
