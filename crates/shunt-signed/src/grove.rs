//! Grove: serves a configuration file as a signed envelope over HTTP
//!
//! The file is re-read every second. `GET /config` returns the current
//! document; `GET /config?wait=true` blocks until the document next changes,
//! which lets pullers long-poll.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use shunt_config::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::envelope::SignedDocument;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed so identical documents encode to identical bodies (and ETags)
pub const GROVE_BOUNDARY: &str = "2dcadde02f30b24cb66cd69ca3b20cc361a64e713babf1762c645470bbde";

#[derive(Debug, Clone)]
struct Snapshot {
    document: Arc<Vec<u8>>,
    modified: DateTime<Utc>,
}

struct GroveInner {
    path: PathBuf,
    key: SigningKey,
    snapshot: watch::Sender<Snapshot>,
    stop: CancellationToken,
}

impl GroveInner {
    fn load(&self) -> Option<Vec<u8>> {
        match Config::load(&self.path).and_then(|config| config.serialize()) {
            Ok(document) => Some(document),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    fn update(&self) {
        let Some(document) = self.load() else {
            return;
        };
        let changed = self.snapshot.send_if_modified(|snapshot| {
            if *snapshot.document == document {
                return false;
            }
            *snapshot = Snapshot {
                document: Arc::new(document),
                modified: Utc::now(),
            };
            true
        });
        if changed {
            info!("Updated config from {}", self.path.display());
        }
    }
}

pub struct Grove {
    inner: Arc<GroveInner>,
    tracker: TaskTracker,
}

impl Grove {
    /// Load `path` once and prepare to serve it signed with `key`. A file that
    /// cannot be loaded yet is served as an empty configuration.
    pub fn new(path: impl Into<PathBuf>, key: SigningKey) -> Self {
        let empty = Config::default().serialize().unwrap_or_default();
        let (snapshot, _) = watch::channel(Snapshot {
            document: Arc::new(empty),
            modified: Utc::now(),
        });
        let inner = Arc::new(GroveInner {
            path: path.into(),
            key,
            snapshot,
            stop: CancellationToken::new(),
        });
        inner.update();

        Self {
            inner,
            tracker: TaskTracker::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The document currently being served
    pub fn document(&self) -> Vec<u8> {
        self.inner.snapshot.borrow().document.to_vec()
    }

    /// Start polling the file
    pub fn start(&self) {
        let inner = self.inner.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = ticker.tick() => inner.update(),
                }
            }
            debug!("Grove poller stopped");
        });
    }

    /// Stop polling and release any request blocked in `wait=true`
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/config", get(serve_config))
            .with_state(self.inner.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    wait: Option<String>,
}

/// Boolean query values in the spellings commonly accepted for flags
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Quoted base64 SHA-256 of the response body
pub fn etag_for(body: &[u8]) -> String {
    format!("\"{}\"", STANDARD.encode(Sha256::digest(body)))
}

fn http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn encode(key: &SigningKey, snapshot: &Snapshot) -> Vec<u8> {
    SignedDocument::sign(snapshot.document.to_vec(), key).encode(GROVE_BOUNDARY)
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

async fn serve_config(
    State(grove): State<Arc<GroveInner>>,
    Query(query): Query<ConfigQuery>,
    headers: HeaderMap,
) -> Response {
    let wait = match query.wait.as_deref() {
        None | Some("") => false,
        Some(value) => match parse_bool(value) {
            Some(wait) => wait,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Invalid value for 'wait' query parameter\n",
                )
                    .into_response()
            }
        },
    };

    let mut updates = grove.snapshot.subscribe();
    let mut snapshot = updates.borrow_and_update().clone();
    let mut body = encode(&grove.key, &snapshot);
    let mut etag = etag_for(&body);

    // A client holding an older document gets the current one straight away.
    let stale = headers.contains_key(header::IF_NONE_MATCH) && !etag_matches(&headers, &etag);
    if wait && !stale {
        tokio::select! {
            _ = grove.stop.cancelled() => {
                return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down\n").into_response();
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down\n").into_response();
                }
            }
        }
        snapshot = updates.borrow_and_update().clone();
        body = encode(&grove.key, &snapshot);
        etag = etag_for(&body);
    }

    let mut response = if etag_matches(&headers, &etag) {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        (
            [(
                header::CONTENT_TYPE,
                SignedDocument::content_type(GROVE_BOUNDARY),
            )],
            body,
        )
            .into_response()
    };

    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response_headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(snapshot.modified)) {
        response_headers.insert(header::LAST_MODIFIED, value);
    }
    response
}
