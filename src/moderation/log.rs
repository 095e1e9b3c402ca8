//! Request log seam.
//!
//! Moderated requests are saved before they are held, and the id the log
//! assigns becomes their moderation id. Durable storage lives outside this
//! crate; [`MemoryRequestLog`] keeps records in process only while their
//! request is held.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;

/// Summary of a request as it arrived at the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// HTTP method.
    pub method: String,
    /// Request target as received.
    pub uri: String,
    /// `Host` header or URI host.
    pub host: String,
    /// Client address.
    pub remote_addr: SocketAddr,
    /// When the proxy received the request.
    pub received_at: SystemTime,
}

/// Errors from saving a request record.
#[derive(Debug, Error)]
pub enum RequestLogError {
    /// The backing store could not accept the record.
    #[error("Request log unavailable: {0}")]
    Unavailable(String),
}

/// Persists request records and assigns their ids.
#[async_trait]
pub trait RequestLog: Send + Sync {
    /// Save `record` and return its id.
    async fn save_request(&self, record: RequestRecord) -> Result<u64, RequestLogError>;

    /// Called once request `id` is no longer held, whether it was released,
    /// dropped or abandoned. Stores that only serve the operator can forget
    /// the record here.
    fn request_finished(&self, _id: u64) {}
}

/// In-memory [`RequestLog`] with sequential ids starting at 1.
///
/// Records are removed when their request finishes, so the log only ever
/// holds the requests currently waiting for the operator.
#[derive(Debug)]
pub struct MemoryRequestLog {
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, RequestRecord>>,
}

impl MemoryRequestLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The record saved under `id`.
    pub fn get(&self, id: u64) -> Option<RequestRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Number of records kept.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether no records are kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryRequestLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestLog for MemoryRequestLog {
    async fn save_request(&self, record: RequestRecord) -> Result<u64, RequestLogError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.records.lock().unwrap().insert(id, record);
        Ok(id)
    }

    fn request_finished(&self, id: u64) {
        self.records.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uri: &str) -> RequestRecord {
        RequestRecord {
            method: "GET".into(),
            uri: uri.into(),
            host: "example.com".into(),
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
            received_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let log = MemoryRequestLog::new();
        let first = log.save_request(record("/a")).await.unwrap();
        let second = log.save_request(record("/b")).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(log.get(2).unwrap().uri, "/b");
        assert!(log.get(3).is_none());
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_finished_requests_are_forgotten() {
        let log = MemoryRequestLog::new();
        let first = log.save_request(record("/a")).await.unwrap();
        let second = log.save_request(record("/b")).await.unwrap();

        log.request_finished(first);
        log.request_finished(first);

        assert!(log.get(first).is_none());
        assert_eq!(log.get(second).unwrap().uri, "/b");
        assert_eq!(log.len(), 1);

        log.request_finished(second);
        assert!(log.is_empty());
        assert_eq!(log.save_request(record("/c")).await.unwrap(), 3);
    }
}
