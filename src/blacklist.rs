use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Discovery cooldown on the server: once a host UUID has been answered, all
/// further queries for it are ignored for this long, whatever their source.
pub const BLACKLIST_TIMEOUT_SERVER: Duration = Duration::from_secs(10);

/// Response blacklist on the client: after a server has answered once, its
/// address is ignored for this long so a single announcement does not trigger
/// repeated TCP attempts.
pub const BLACKLIST_TIMEOUT_CLIENT: Duration = Duration::from_secs(1);

/// A set whose members expire after a fixed window.
///
/// Backs both the server-side discovery cooldown (keyed by host UUID) and the
/// client-side response blacklist (keyed by responder IP). Expired entries
/// are pruned on every query.
pub struct TimedSet<K> {
    entries: Mutex<HashMap<K, Instant>>,
    window: Duration,
}

impl<K: Eq + Hash> TimedSet<K> {
    pub fn new(window: Duration) -> Self {
        TimedSet {
            entries: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Add or refresh an entry; its window starts now.
    pub async fn insert(&self, key: K) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, Instant::now());
    }

    pub async fn contains(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let window = self.window;
        entries.retain(|_, inserted| now.duration_since(*inserted) < window);
        entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let window = self.window;
        entries.retain(|_, inserted| now.duration_since(*inserted) < window);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
