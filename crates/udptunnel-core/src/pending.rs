//! Pending reply handlers.
//!
//! Tracks requests that were relayed to the other side and are waiting for a
//! reply with the same correlation ID. Entries that see no activity for the
//! idle timeout are swept.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Idle time after which an unanswered handler is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Period of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

type HandlerFn = dyn FnOnce(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send;

/// One-shot callback that delivers a reply payload to the original requester.
pub struct ReplyHandler(Box<HandlerFn>);

impl ReplyHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move |payload| Box::pin(f(payload))))
    }

    /// Consume the handler, delivering `payload`.
    pub async fn invoke(self, payload: Vec<u8>) {
        (self.0)(payload).await;
    }
}

impl fmt::Debug for ReplyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyHandler")
    }
}

struct Entry {
    handler: ReplyHandler,
    touched: Instant,
}

/// Correlation ID to reply handler map.
pub struct PendingTable {
    entries: Mutex<HashMap<u32, Entry>>,
    idle_timeout: Duration,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl PendingTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Register `handler` under `id`, replacing any previous handler.
    pub async fn put(&self, id: u32, handler: ReplyHandler) {
        let replaced = self
            .entries
            .lock()
            .await
            .insert(
                id,
                Entry {
                    handler,
                    touched: Instant::now(),
                },
            )
            .is_some();
        debug!(id, replaced, "Registered reply handler");
    }

    /// Refresh the idle clock of `id`. Returns whether the entry exists.
    pub async fn touch(&self, id: u32) -> bool {
        match self.entries.lock().await.get_mut(&id) {
            Some(entry) => {
                entry.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    /// Remove and return the handler for `id`.
    pub async fn take(&self, id: u32) -> Option<ReplyHandler> {
        self.entries.lock().await.remove(&id).map(|e| e.handler)
    }

    /// Evict every entry idle for longer than the idle timeout.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.touched) <= self.idle_timeout);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept idle reply handlers");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::advance;

    fn noop() -> ReplyHandler {
        ReplyHandler::new(|_| async {})
    }

    #[tokio::test]
    async fn take_returns_handler_once() {
        let table = PendingTable::default();
        let (tx, rx) = oneshot::channel();
        table
            .put(
                7,
                ReplyHandler::new(move |payload| async move {
                    let _ = tx.send(payload);
                }),
            )
            .await;

        let handler = table.take(7).await.unwrap();
        assert!(table.take(7).await.is_none());

        handler.invoke(b"reply".to_vec()).await;
        assert_eq!(rx.await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn put_overwrites() {
        let table = PendingTable::default();
        table.put(1, noop()).await;
        table.put(1, noop()).await;
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_entries() {
        let table = PendingTable::new(Duration::from_secs(15));
        table.put(1, noop()).await;
        table.put(2, noop()).await;

        advance(Duration::from_secs(10)).await;
        assert_eq!(table.sweep().await, 0);

        advance(Duration::from_secs(6)).await;
        assert_eq!(table.sweep().await, 2);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_entry_alive() {
        let table = PendingTable::new(Duration::from_secs(15));
        table.put(1, noop()).await;
        table.put(2, noop()).await;

        advance(Duration::from_secs(10)).await;
        assert!(table.touch(1).await);
        assert!(!table.touch(99).await);

        advance(Duration::from_secs(6)).await;
        assert_eq!(table.sweep().await, 1);
        assert!(table.contains(1).await);
        assert!(!table.contains(2).await);
    }
}
