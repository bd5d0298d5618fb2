//! Fire-and-forget request auditing.
//!
//! ```text
//!   handlers ──try_send──► [ bounded mpsc queue ] ──recv──► worker ──► GatewayStore
//!                  │
//!                  └─ queue full / closed: entry dropped, counted
//! ```
//!
//! The response path never waits on the store. The worker lives in the
//! application's `TaskTracker`; on cancellation it closes the queue and
//! persists whatever is still buffered before exiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::middleware::auth::API_KEY_HEADER;
use crate::models::NewRequestLog;
use crate::store::GatewayStore;

/// Stand-in for credential values in recorded headers.
pub const REDACTED: &str = "[REDACTED]";

/// First `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text.get(..byte_index).unwrap_or(text),
        None => text,
    }
}

/// Headers as a flat map for the audit row. Names are lowercase, repeated
/// headers are joined with `", "`, the API key is redacted.
pub fn header_snapshot(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut snapshot: BTreeMap<String, String> = BTreeMap::new();

    for (name, value) in headers {
        let value = if name.as_str() == API_KEY_HEADER {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };

        snapshot
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    snapshot
}

/// Decoded query parameters; the last occurrence of a repeated key wins.
pub fn query_params(uri: &Uri) -> BTreeMap<String, String> {
    Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs.into_iter().collect())
        .unwrap_or_default()
}

/// Handle to the audit queue. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<NewRequestLog>,
    dropped: Arc<AtomicU64>,
    body_max_chars: usize,
}

impl AuditLogger {
    fn channel(capacity: usize, body_max_chars: usize) -> (Self, mpsc::Receiver<NewRequestLog>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let logger = Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            body_max_chars,
        };
        (logger, receiver)
    }

    /// Create the queue and start its worker on `tracker`.
    pub fn spawn(
        store: Arc<dyn GatewayStore>,
        capacity: usize,
        body_max_chars: usize,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (logger, receiver) = Self::channel(capacity, body_max_chars);
        tracker.spawn(run_worker(store, receiver, cancel));
        info!(capacity, body_max_chars, "Audit logger started");
        logger
    }

    /// Response body as stored: lossy UTF-8, at most `body_max_chars`
    /// characters.
    pub fn body_text(&self, body: &[u8]) -> String {
        // No character is wider than 4 bytes.
        let prefix = body
            .get(..self.body_max_chars.saturating_mul(4))
            .unwrap_or(body);
        let text = String::from_utf8_lossy(prefix);
        truncate_chars(&text, self.body_max_chars).to_string()
    }

    /// Queue `entry` without waiting. Dropped and counted if the queue is
    /// full or the worker has stopped.
    pub fn record(&self, mut entry: NewRequestLog) {
        if let Some(body) = entry.response_body.as_mut()
            && body.chars().count() > self.body_max_chars
        {
            let truncated = truncate_chars(body, self.body_max_chars).to_string();
            *body = truncated;
        }

        match self.sender.try_send(entry) {
            Ok(()) => {
                metrics::set_audit_queue_depth(self.queue_depth());
            }
            Err(err) => {
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "worker stopped",
                };
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_audit_dropped();
                warn!(reason, dropped_total = total, "Dropping audit entry");
            }
        }
    }

    /// Entries dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

async fn persist(store: &dyn GatewayStore, entry: &NewRequestLog) {
    if let Err(e) = store.insert_request_log(entry).await {
        metrics::record_audit_write_failure();
        error!(
            error = %e,
            log_id = %entry.log_id,
            user_id = %entry.user_id,
            endpoint = %entry.endpoint,
            "Failed to persist audit entry"
        );
    }
}

async fn run_worker(
    store: Arc<dyn GatewayStore>,
    mut receiver: mpsc::Receiver<NewRequestLog>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Audit worker received cancellation signal");
                break;
            }
            entry = receiver.recv() => match entry {
                Some(entry) => persist(store.as_ref(), &entry).await,
                None => {
                    debug!("Audit queue closed, worker exiting");
                    return;
                }
            }
        }
    }

    receiver.close();
    let mut drained = 0usize;
    while let Some(entry) = receiver.recv().await {
        persist(store.as_ref(), &entry).await;
        drained += 1;
    }
    metrics::set_audit_queue_depth(0);
    info!(drained, "Audit worker drained queue and stopped");
}
