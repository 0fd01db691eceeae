//! HTTP puller: a configuration source that long-polls a grove
//!
//! The first request fetches the current document; later requests add
//! `wait=true` and block until the document changes. Every document is
//! verified against the key ring before it is parsed. Transport failures and
//! non-success statuses are retried with backoff and never delivered.

use async_trait::async_trait;
use reqwest::header::{HeaderName, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use shunt_config::{
    backoff_delay, Callback, Config, NoopSourceMetrics, Source, SourceError, SourceEvent,
    SourceMetrics, Subscription, TaskSlot, Watchers,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::SignedDocument;
use crate::keyring::KeyRing;

#[derive(Debug, Clone)]
pub struct PullOptions {
    /// First retry delay; doubles on every consecutive failure
    pub backoff_unit: Duration,
    /// Limit on one request, including a long poll
    pub request_timeout: Duration,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(1),
            request_timeout: Duration::from_secs(300),
        }
    }
}

pub struct HttpSource {
    inner: Arc<PullInner>,
    task: TaskSlot,
}

struct PullInner {
    url: String,
    keyring: KeyRing,
    client: reqwest::Client,
    options: PullOptions,
    watchers: Watchers,
    metrics: Arc<dyn SourceMetrics>,
}

enum Fetched {
    NotModified,
    Document {
        content_type: String,
        body: Vec<u8>,
        etag: Option<String>,
    },
}

impl HttpSource {
    pub fn new(url: impl Into<String>, keyring: KeyRing) -> Self {
        Self::with_options(
            url,
            keyring,
            PullOptions::default(),
            Arc::new(NoopSourceMetrics),
        )
    }

    pub fn with_options(
        url: impl Into<String>,
        keyring: KeyRing,
        options: PullOptions,
        metrics: Arc<dyn SourceMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(PullInner {
                url: url.into(),
                keyring,
                client: reqwest::Client::new(),
                options,
                watchers: Watchers::new(),
                metrics,
            }),
            task: TaskSlot::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn current(&self) -> Option<Arc<Config>> {
        self.inner.watchers.current()
    }
}

fn wait_url(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}wait=true", url, separator)
}

impl PullInner {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<Fetched, String> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.options.request_timeout);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !status.is_success() {
            return Err(format!("{} returned {}", url, status));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE).unwrap_or_default();
        let etag = header(ETAG);
        let body = response.bytes().await.map_err(|e| e.to_string())?;

        Ok(Fetched::Document {
            content_type,
            body: body.to_vec(),
            etag,
        })
    }

    /// Verify and parse one envelope
    fn open(&self, content_type: &str, body: &[u8]) -> SourceEvent {
        let document = SignedDocument::decode(content_type, body).map_err(|e| {
            self.metrics.read_failed();
            SourceError::Read(e.to_string())
        })?;

        let signer = self
            .keyring
            .verify(&document.document, &document.signature)
            .map_err(|e| {
                self.metrics.read_failed();
                SourceError::Signature(e.to_string())
            })?;
        debug!("Good signature from key {}", signer);

        let config = Config::parse(&document.document).map_err(|e| {
            self.metrics.parse_failed();
            SourceError::from(e)
        })?;
        self.metrics.load_succeeded();
        Ok(Arc::new(config))
    }

    async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!("Pulling configuration from {}", self.url);
        let mut attempt = 0u32;
        let mut etag: Option<String> = None;
        let mut synced = false;

        loop {
            let url = if synced {
                wait_url(&self.url)
            } else {
                self.url.clone()
            };

            self.metrics.load_attempted();
            let fetched = tokio::select! {
                _ = stop.cancelled() => break,
                fetched = self.fetch(&url, etag.as_deref()) => fetched,
            };

            match fetched {
                Ok(Fetched::NotModified) => {
                    attempt = 0;
                    synced = true;
                    self.metrics.load_succeeded();
                }
                Ok(Fetched::Document {
                    content_type,
                    body,
                    etag: new_etag,
                }) => {
                    attempt = 0;
                    synced = true;
                    etag = new_etag;
                    let event = self.open(&content_type, &body);
                    if stop.is_cancelled() {
                        break;
                    }
                    self.watchers.publish(event).await;
                }
                Err(e) => {
                    self.metrics.read_failed();
                    synced = false;
                    let delay = backoff_delay(self.options.backoff_unit, attempt);
                    attempt = attempt.saturating_add(1);
                    warn!("Failed to pull configuration: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("Puller for {} stopped", self.url);
    }
}

#[async_trait]
impl Source for HttpSource {
    fn start(&self) {
        let inner = self.inner.clone();
        self.task.start(move |stop| inner.run(stop));
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    async fn watch(&self, callback: Callback) -> Subscription {
        self.inner.watchers.subscribe(callback).await
    }

    fn unwatch(&self, subscription: Subscription) {
        self.inner.watchers.unsubscribe(subscription);
    }
}
