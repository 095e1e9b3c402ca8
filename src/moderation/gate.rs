//! Hold-for-approval proxy handler.

use super::log::{RequestLog, RequestRecord};
use super::queue::ModerationQueue;
use crate::proxy::error::UNAVAILABLE_MESSAGE;
use crate::proxy::{text_response, ProxyBody, ProxyHandler, ProxySession};
use async_trait::async_trait;
use hyper::header::HOST;
use hyper::{Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Body text for a held request that was dropped instead of approved.
pub const NOT_APPROVED_MESSAGE: &str = "request was not approved";

/// Moderation state shared by the gate and the operator console.
pub struct Moderation {
    queue: ModerationQueue,
    log: Arc<dyn RequestLog>,
    enabled: AtomicBool,
}

impl Moderation {
    /// Create moderation state saving records to `log`.
    pub fn new(log: Arc<dyn RequestLog>, enabled: bool) -> Self {
        Self {
            queue: ModerationQueue::new(),
            log,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// The pending-request queue.
    pub fn queue(&self) -> &ModerationQueue {
        &self.queue
    }

    /// The request log.
    pub fn log(&self) -> &Arc<dyn RequestLog> {
        &self.log
    }

    /// Whether new requests are held.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Turn moderation on or off.
    ///
    /// Turning it off releases every request currently held.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Moderation {}", if enabled { "enabled" } else { "disabled" });
        }
        if !enabled {
            self.queue.flush();
        }
    }
}

impl std::fmt::Debug for Moderation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Moderation")
            .field("enabled", &self.is_enabled())
            .field("pending", &self.queue.pending_count())
            .finish()
    }
}

/// Proxy handler that holds each request until it is released.
///
/// While moderation is enabled every session is saved to the request log,
/// queued under the returned id and only passed to `inner` once released.
pub struct ModerationGate {
    moderation: Arc<Moderation>,
    inner: Arc<dyn ProxyHandler>,
}

impl ModerationGate {
    /// Gate `inner` behind `moderation`.
    pub fn new(moderation: Arc<Moderation>, inner: Arc<dyn ProxyHandler>) -> Self {
        Self { moderation, inner }
    }
}

/// Removes a queue entry and tells the log when the waiting request finishes
/// or is cancelled.
struct PendingEntry<'a> {
    queue: &'a ModerationQueue,
    log: &'a dyn RequestLog,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.id);
        self.log.request_finished(self.id);
    }
}

fn record_for(session: &ProxySession) -> RequestRecord {
    let request = session.request();
    let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();

    RequestRecord {
        method: request.method().to_string(),
        uri: request.uri().to_string(),
        host,
        remote_addr: session.remote_addr(),
        received_at: SystemTime::now(),
    }
}

#[async_trait]
impl ProxyHandler for ModerationGate {
    async fn handle_proxy(&self, session: ProxySession) -> Response<ProxyBody> {
        if !self.moderation.is_enabled() {
            return self.inner.handle_proxy(session).await;
        }

        let record = record_for(&session);
        let id = match self.moderation.log.save_request(record.clone()).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to save {} {}: {}", record.method, record.uri, e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE);
            }
        };

        let (tx, rx) = oneshot::channel();
        let queue = &self.moderation.queue;
        queue.add(id, tx);
        let entry = PendingEntry {
            queue,
            log: self.moderation.log.as_ref(),
            id,
        };

        // A flush may have run between the enabled check and the add
        let released = if self.moderation.is_enabled() {
            info!(id, "Holding {} {} from {}", record.method, record.uri, record.remote_addr);
            rx.await.is_ok()
        } else {
            true
        };
        drop(entry);

        if !released {
            debug!(id, "Request dropped by operator");
            return text_response(StatusCode::FORBIDDEN, NOT_APPROVED_MESSAGE);
        }

        debug!(id, "Request released");
        self.inner.handle_proxy(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::log::{MemoryRequestLog, RequestLogError};
    use crate::proxy::{empty_body, ProxyContext, Transport};
    use http_body_util::BodyExt;
    use hyper::Request;
    use std::time::Duration;

    /// Answers 200 without touching the network.
    struct Ok200;

    #[async_trait]
    impl ProxyHandler for Ok200 {
        async fn handle_proxy(&self, _session: ProxySession) -> Response<ProxyBody> {
            text_response(StatusCode::OK, "done")
        }
    }

    struct FailingLog;

    #[async_trait]
    impl RequestLog for FailingLog {
        async fn save_request(&self, _record: RequestRecord) -> Result<u64, RequestLogError> {
            Err(RequestLogError::Unavailable("disk full".into()))
        }
    }

    fn session() -> ProxySession {
        let context = Arc::new(ProxyContext::new(
            Transport::with_roots(rustls::RootCertStore::empty()),
            "Test/1.0",
        ));
        let request = Request::builder()
            .uri("http://example.com/")
            .header(HOST, "example.com")
            .body(empty_body())
            .unwrap();
        ProxySession::new(request, "127.0.0.1:4000".parse().unwrap(), context)
    }

    async fn wait_for_pending(moderation: &Moderation, count: usize) {
        for _ in 0..100 {
            if moderation.queue().pending_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} pending requests", count);
    }

    fn gate(log: Arc<dyn RequestLog>, enabled: bool) -> (Arc<Moderation>, Arc<ModerationGate>) {
        let moderation = Arc::new(Moderation::new(log, enabled));
        let gate = Arc::new(ModerationGate::new(moderation.clone(), Arc::new(Ok200)));
        (moderation, gate)
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let (moderation, gate) = gate(Arc::new(MemoryRequestLog::new()), false);
        let response = gate.handle_proxy(session()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(moderation.queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_approve_releases_request() {
        let log = Arc::new(MemoryRequestLog::new());
        let (moderation, gate) = gate(log.clone(), true);

        let task = tokio::spawn({
            let gate = gate.clone();
            async move { gate.handle_proxy(session()).await }
        });
        wait_for_pending(&moderation, 1).await;

        let id = moderation.queue().list()[0];
        assert_eq!(log.get(id).unwrap().host, "example.com");
        moderation.queue().approve(id).unwrap();

        let response = task.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(moderation.queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disable_flushes_held_requests() {
        let (moderation, gate) = gate(Arc::new(MemoryRequestLog::new()), true);

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.handle_proxy(session()).await })
            })
            .collect();
        wait_for_pending(&moderation, 3).await;

        moderation.set_enabled(false);

        for task in tasks {
            assert_eq!(task.await.unwrap().status(), StatusCode::OK);
        }
        assert!(moderation.queue().list().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_is_forbidden() {
        let (moderation, gate) = gate(Arc::new(MemoryRequestLog::new()), true);

        let task = tokio::spawn({
            let gate = gate.clone();
            async move { gate.handle_proxy(session()).await }
        });
        wait_for_pending(&moderation, 1).await;

        let id = moderation.queue().list()[0];
        assert!(moderation.queue().remove(id));

        let response = task.await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], NOT_APPROVED_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_log_failure_is_unavailable() {
        let (moderation, gate) = gate(Arc::new(FailingLog), true);
        let response = gate.handle_proxy(session()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(moderation.queue().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_log_only_keeps_held_requests() {
        let log = Arc::new(MemoryRequestLog::new());
        let (moderation, gate) = gate(log.clone(), true);

        for round in 0..5 {
            let tasks: Vec<_> = (0..4)
                .map(|_| {
                    let gate = gate.clone();
                    tokio::spawn(async move { gate.handle_proxy(session()).await })
                })
                .collect();
            wait_for_pending(&moderation, 4).await;
            assert_eq!(log.len(), 4);

            let ids = moderation.queue().list();
            moderation.queue().approve(ids[0]).unwrap();
            assert!(moderation.queue().remove(ids[1]));
            if round % 2 == 0 {
                moderation.queue().flush();
            } else {
                moderation.set_enabled(false);
                moderation.set_enabled(true);
            }

            for task in tasks {
                task.await.unwrap();
            }
            assert!(log.is_empty());
        }
    }

    #[tokio::test]
    async fn test_cancelled_wait_clears_entry() {
        let log = Arc::new(MemoryRequestLog::new());
        let (moderation, gate) = gate(log.clone(), true);

        let task = tokio::spawn({
            let gate = gate.clone();
            async move { gate.handle_proxy(session()).await }
        });
        wait_for_pending(&moderation, 1).await;

        task.abort();
        let _ = task.await;
        assert_eq!(moderation.queue().pending_count(), 0);
        assert!(log.is_empty());
    }
}
