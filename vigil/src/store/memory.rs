use super::Store;
use crate::error::{Result, VigilError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// In-process store shared by simulated ranks.
///
/// Counts `set`/`get` calls so tests can assert which code paths touched the
/// store.
pub struct MemStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
    published: Notify,
    timeout: Duration,
    sets: AtomicU64,
    gets: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(300))
    }

    /// Store whose `get` gives up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            published: Notify::new(),
            timeout,
            sets: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Number of `set` calls served so far.
    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Current value of `key` without waiting or counting.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().ok()?.get(key).cloned()
    }

    fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .lock()
            .map_err(|_| VigilError::LockPoisoned("store"))?;
        Ok(data.get(key).cloned())
    }

    async fn wait_for(&self, key: &str) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            // Register before looking so a concurrent set cannot slip between.
            notified.as_mut().enable();
            if let Some(v) = self.lookup(key)? {
                return Ok(v);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(VigilError::store(
                    key,
                    format!("timed out after {:?} waiting for key", self.timeout),
                ));
            }
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.data
                .lock()
                .map_err(|_| VigilError::LockPoisoned("store"))?
                .insert(key.to_string(), value);
            self.published.notify_waiters();
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.gets.fetch_add(1, Ordering::Relaxed);
            self.wait_for(key).await
        })
    }

    fn check<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let data = self
                .data
                .lock()
                .map_err(|_| VigilError::LockPoisoned("store"))?;
            Ok(keys.iter().all(|k| data.contains_key(k)))
        })
    }
}
