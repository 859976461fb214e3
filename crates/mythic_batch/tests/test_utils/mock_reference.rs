//! Counting reference store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mythic_error::{MythicResult, ProviderError, ProviderErrorKind};
use mythic_interface::{ReferenceStore, RemoteReference};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reference store that records uploads instead of staging them.
#[derive(Default)]
pub struct MockReferenceStore {
    uploads: Arc<Mutex<Vec<String>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    failing: HashSet<String>,
    transient_failures: usize,
    expires_at: Option<DateTime<Utc>>,
    upload_delay: Option<Duration>,
    in_flight: Arc<Mutex<usize>>,
    peak_in_flight: Arc<Mutex<usize>>,
}

impl MockReferenceStore {
    /// A store where every upload succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads of `hash` always fail with a non-retryable rejection.
    pub fn failing_for(mut self, hash: &str) -> Self {
        self.failing.insert(hash.to_string());
        self
    }

    /// Every hash fails `count` times with a retryable error before succeeding.
    pub fn with_transient_failures(mut self, count: usize) -> Self {
        self.transient_failures = count;
        self
    }

    /// Uploads report this expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Each upload takes this long, so concurrent uploads overlap.
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Most uploads ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        *self.peak_in_flight.lock().unwrap()
    }

    /// Hashes uploaded successfully, in order.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// Upload attempts for a hash, successful or not.
    pub fn attempts_for(&self, hash: &str) -> usize {
        self.attempts.lock().unwrap().get(hash).copied().unwrap_or(0)
    }

    /// URIs deleted, in order.
    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReferenceStore for MockReferenceStore {
    async fn upload(
        &self,
        data: &[u8],
        content_hash: &str,
        _mime: &str,
    ) -> MythicResult<RemoteReference> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut peak = self.peak_in_flight.lock().unwrap();
            *peak = (*peak).max(*in_flight);
        }
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.record_upload(data, content_hash);
        *self.in_flight.lock().unwrap() -= 1;
        result
    }

    async fn delete(&self, uri: &str) -> MythicResult<()> {
        self.deletes.lock().unwrap().push(uri.to_string());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}

impl MockReferenceStore {
    fn record_upload(&self, data: &[u8], content_hash: &str) -> MythicResult<RemoteReference> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(content_hash.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if self.failing.contains(content_hash) {
            return Err(ProviderError::new(ProviderErrorKind::Rejected(format!(
                "refused {}",
                content_hash
            )))
            .into());
        }
        if attempt <= self.transient_failures {
            return Err(ProviderError::http(503, "try again").into());
        }
        self.uploads.lock().unwrap().push(content_hash.to_string());
        Ok(RemoteReference::new(
            format!("mock://files/{}", content_hash),
            data.len() as u64,
            self.expires_at,
        ))
    }
}
