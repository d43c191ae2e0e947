use crate::connection::Connection;
use crate::error::{BraviaError, Result};
use crate::protocol::{Reply, Request};
use crate::types::FeatureValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Lowest request id handed out after wrapping
const ID_FLOOR: u64 = 10;
/// Ids wrap back to the floor past this value
const ID_CEILING: u64 = 1_000_000;

type Waiter = oneshot::Sender<Result<FeatureValue>>;

/// Outstanding requests keyed by id
struct PendingTable {
    last_id: u64,
    waiters: HashMap<u64, Waiter>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            last_id: ID_FLOOR,
            waiters: HashMap::new(),
        }
    }

    /// Next id that is not currently outstanding
    fn allocate(&mut self) -> u64 {
        loop {
            self.last_id = if self.last_id >= ID_CEILING {
                ID_FLOOR
            } else {
                self.last_id + 1
            };
            if !self.waiters.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }
}

/// Correlates requests with the results the device sends back
///
/// Any number of requests may be outstanding at once; each is resolved by id
/// in whatever order results arrive.
pub struct Dispatcher {
    connection: Arc<Connection>,
    pending: Mutex<PendingTable>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(connection: Arc<Connection>, request_timeout: Duration) -> Self {
        Self {
            connection,
            pending: Mutex::new(PendingTable::new()),
            request_timeout,
        }
    }

    /// Read the current value of a feature
    pub async fn get(&self, feature: &str) -> Result<FeatureValue> {
        self.request(feature, |id| Request::get(id, feature)).await
    }

    /// Set a feature, returning the device's reply (usually `"ACK"`)
    pub async fn set(&self, feature: &str, value: FeatureValue) -> Result<FeatureValue> {
        self.request(feature, |id| Request::set(id, feature, value))
            .await
    }

    async fn request(
        &self,
        feature: &str,
        build: impl FnOnce(u64) -> Request,
    ) -> Result<FeatureValue> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut pending = self.lock();
            let id = pending.allocate();
            pending.waiters.insert(id, tx);
            id
        };

        if let Err(e) = self.connection.send(build(id)) {
            self.lock().waiters.remove(&id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BraviaError::ConnectionLost),
            Err(_) => {
                self.lock().waiters.remove(&id);
                tracing::warn!("Timeout waiting for {} (id {})", feature, id);
                Err(BraviaError::Timeout {
                    feature: feature.to_string(),
                })
            }
        }
    }

    /// Hand a result to its waiting request
    ///
    /// Returns false when no request with that id is outstanding, e.g. a
    /// late answer to a request that already timed out.
    pub fn resolve(&self, reply: Reply) -> bool {
        let waiter = self.lock().waiters.remove(&reply.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(reply.value));
                true
            }
            None => {
                tracing::debug!("Dropping unmatched result {}", reply.id);
                false
            }
        }
    }

    /// Fail every outstanding request with `ConnectionLost`
    pub fn fail_all(&self) {
        let waiters: Vec<_> = self.lock().waiters.drain().collect();
        if !waiters.is_empty() {
            tracing::info!("Failing {} outstanding requests", waiters.len());
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(BraviaError::ConnectionLost));
        }
    }

    /// Number of requests awaiting a result
    pub fn outstanding(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;

    #[test]
    fn ids_increase_and_wrap() {
        let mut table = PendingTable::new();
        assert_eq!(table.allocate(), 11);
        assert_eq!(table.allocate(), 12);

        table.last_id = ID_CEILING - 1;
        assert_eq!(table.allocate(), ID_CEILING);
        assert_eq!(table.allocate(), ID_FLOOR);
    }

    #[test]
    fn outstanding_ids_are_skipped() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        table.waiters.insert(11, tx);
        assert_eq!(table.allocate(), 12);
    }

    #[tokio::test]
    async fn unmatched_result_is_dropped() {
        let connection = Arc::new(Connection::new(&ClientConfig::default()));
        let dispatcher = Dispatcher::new(connection, Duration::from_secs(1));
        let reply = Reply {
            id: 99,
            feature: None,
            value: json!("ACK"),
        };
        assert!(!dispatcher.resolve(reply));
    }

    #[tokio::test]
    async fn request_while_disconnected_releases_id() {
        let connection = Arc::new(Connection::new(&ClientConfig::default()));
        let dispatcher = Dispatcher::new(connection, Duration::from_secs(1));
        let err = dispatcher.get("main.power").await.unwrap_err();
        assert!(matches!(err, BraviaError::NotConnected));
        assert_eq!(dispatcher.outstanding(), 0);
    }
}
