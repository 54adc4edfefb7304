//! Correlation table turning one-way messages into awaitable exchanges
//!
//! Each outgoing request registers an entry under a correlation key and gets
//! back an [`Exchange`]. The inbound side completes the entry by key; the
//! waiting side gives up at its deadline. Whichever happens first removes the
//! entry, and dropping an `Exchange` removes it too, so a cancelled caller
//! never leaves a stale entry behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{Error, Result};

type Entries<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

struct Entry<T> {
    ticket: u64,
    tx: oneshot::Sender<Result<T>>,
    sent_at: Instant,
}

/// Pending exchanges keyed by correlation id
pub struct PendingTable<T> {
    entries: Entries<T>,
    next_ticket: AtomicU64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Register an exchange under `key`
    ///
    /// An exchange already pending under the same key is failed with
    /// `Error::Superseded` before the new one is inserted.
    pub fn register(&self, key: impl Into<String>) -> Exchange<T> {
        let key = key.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let previous = lock(&self.entries).insert(
            key.clone(),
            Entry {
                ticket,
                tx,
                sent_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(key = %key, "superseding pending exchange");
            let _ = previous.tx.send(Err(Error::Superseded(format!(
                "new request for {key} cancelled the pending one"
            ))));
        }

        Exchange {
            key,
            ticket,
            rx,
            entries: Arc::clone(&self.entries),
        }
    }

    /// Complete the exchange pending under `key`
    ///
    /// Returns the time elapsed since registration, or `None` when nothing
    /// was pending (late, duplicate, or unknown response).
    pub fn complete(&self, key: &str, outcome: Result<T>) -> Option<Duration> {
        let entry = lock(&self.entries).remove(key)?;
        let elapsed = entry.sent_at.elapsed();
        // Receiver may have just timed out; the entry is gone either way
        let _ = entry.tx.send(outcome);
        Some(elapsed)
    }

    /// Whether an exchange is pending under `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    /// Number of pending exchanges
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waiting side of a registered exchange
pub struct Exchange<T> {
    key: String,
    ticket: u64,
    rx: oneshot::Receiver<Result<T>>,
    entries: Entries<T>,
}

impl<T> Exchange<T> {
    /// Wait for the response until `timeout` elapses
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when no response arrived in time, or the error
    /// the exchange was completed with
    pub async fn wait(mut self, timeout: Duration, operation: &'static str) -> Result<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Mqtt(format!("{operation} exchange closed"))),
            Err(_) => Err(Error::Timeout {
                operation,
                after: timeout,
            }),
        }
    }
}

impl<T> Drop for Exchange<T> {
    fn drop(&mut self) {
        let mut entries = lock(&self.entries);
        // A superseding exchange may own the key by now
        if entries.get(&self.key).is_some_and(|e| e.ticket == self.ticket) {
            entries.remove(&self.key);
        }
    }
}

fn lock<T>(entries: &Entries<T>) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_waiting_exchange() {
        let table = PendingTable::<u32>::new();
        let exchange = table.register("req-1");
        assert!(table.contains("req-1"));

        assert!(table.complete("req-1", Ok(7)).is_some());
        assert_eq!(exchange.wait(Duration::from_secs(1), "ping").await.unwrap(), 7);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let table = PendingTable::<u32>::new();
        let exchange = table.register("req-1");

        let err = exchange
            .wait(Duration::from_secs(3), "ping")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(table.is_empty());

        // Late response is ignored
        assert!(table.complete("req-1", Ok(1)).is_none());
    }

    #[tokio::test]
    async fn newer_registration_supersedes() {
        let table = PendingTable::<u32>::new();
        let first = table.register("device-1");
        let second = table.register("device-1");

        let err = first.wait(Duration::from_secs(1), "config").await.unwrap_err();
        assert!(matches!(err, Error::Superseded(_)));

        // Dropping the superseded exchange must not remove the newer entry
        assert!(table.contains("device-1"));
        table.complete("device-1", Ok(2));
        assert_eq!(second.wait(Duration::from_secs(1), "config").await.unwrap(), 2);
    }

    #[test]
    fn dropped_exchange_is_cleaned_up() {
        let table = PendingTable::<u32>::new();
        drop(table.register("req-1"));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_elapsed_time() {
        let table = PendingTable::<()>::new();
        let _exchange = table.register("req-1");

        tokio::time::advance(Duration::from_millis(40)).await;
        let elapsed = table.complete("req-1", Ok(())).unwrap();
        assert!(elapsed >= Duration::from_millis(40));
    }
}
