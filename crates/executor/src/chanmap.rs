use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A mapping of alert fingerprints to broadcast cancellation signals.
///
/// It helps trigger an action across a group of listeners without the map
/// needing to track group membership itself: every launch watching a
/// fingerprint holds a clone of the same [`CancellationToken`], and closing
/// the key cancels all of them at once.
pub struct ChannelMap {
    channels: Mutex<HashMap<String, CancellationToken>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cancellation signal for a key, creating it if necessary.
    /// Callers sharing a key get handles backed by the same signal.
    pub async fn acquire(&self, key: &str) -> CancellationToken {
        let mut channels = self.channels.lock().await;
        channels
            .entry(key.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancels the signal for a key and discards the entry.
    ///
    /// Cancelling is idempotent, and a close after removal is a no-op; a
    /// later [`acquire`](Self::acquire) for the same key creates a fresh,
    /// uncancelled signal.
    pub async fn close(&self, key: &str) {
        if let Some(token) = self.channels.lock().await.remove(key) {
            token.cancel();
        }
    }

    /// Cancels and removes every entry.
    pub async fn close_all(&self) {
        for (_, token) in self.channels.lock().await.drain() {
            token.cancel();
        }
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}
