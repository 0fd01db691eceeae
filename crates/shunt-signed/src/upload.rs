//! `POST /upload`: accept a signed configuration and apply it
//!
//! Nothing is applied unless the envelope decodes, the signature verifies
//! against the key ring, and the document parses.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use shunt_config::{Config, ConfigError, ReloadTrigger};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::envelope::{EnvelopeError, SignedDocument};
use crate::keyring::KeyRing;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Serialize(#[from] ConfigError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to back up {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to replace {path}: {source}")]
    Replace {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Where an accepted configuration goes
#[async_trait]
pub trait ConfigSink: Send + Sync {
    async fn apply(&self, config: &Config) -> Result<(), ApplyError>;
}

/// Rewrites the configuration file and fires the reload trigger
pub struct FileApplier {
    path: PathBuf,
    trigger: ReloadTrigger,
}

impl FileApplier {
    pub fn new(path: impl Into<PathBuf>, trigger: ReloadTrigger) -> Self {
        Self {
            path: path.into(),
            trigger,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl ConfigSink for FileApplier {
    /// Write `<file>.NEW`, move the old file to `<file>~`, move the new file into place
    async fn apply(&self, config: &Config) -> Result<(), ApplyError> {
        let raw = config.serialize()?;
        let staged = with_suffix(&self.path, ".NEW");
        let backup = with_suffix(&self.path, "~");
        let shown = self.path.display().to_string();

        tokio::fs::write(&staged, &raw)
            .await
            .map_err(|source| ApplyError::Write {
                path: staged.display().to_string(),
                source,
            })?;

        let _ = tokio::fs::remove_file(&backup).await;
        match tokio::fs::rename(&self.path, &backup).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ApplyError::Backup {
                    path: shown,
                    source,
                })
            }
        }

        if let Err(source) = tokio::fs::rename(&staged, &self.path).await {
            if let Err(e) = tokio::fs::rename(&backup, &self.path).await {
                warn!("Failed to restore {} from backup: {}", shown, e);
            }
            return Err(ApplyError::Replace {
                path: shown,
                source,
            });
        }

        info!("Rewrote {}", shown);
        self.trigger.fire();
        Ok(())
    }
}

#[derive(Clone)]
pub struct UploadState {
    pub keyring: Arc<KeyRing>,
    pub sink: Arc<dyn ConfigSink>,
}

impl UploadState {
    pub fn new(keyring: KeyRing, sink: Arc<dyn ConfigSink>) -> Self {
        Self {
            keyring: Arc::new(keyring),
            sink,
        }
    }
}

pub fn upload_router(state: UploadState) -> Router {
    Router::new()
        .route("/upload", any(handle_upload))
        .with_state(state)
}

fn envelope_status(err: &EnvelopeError) -> StatusCode {
    match err {
        EnvelopeError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn plain(status: StatusCode, message: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message,
    )
        .into_response()
}

async fn handle_upload(
    State(state): State<UploadState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return (StatusCode::OK, [(header::ALLOW, "POST")]).into_response();
    }
    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "POST")],
            "Requires method: POST\n",
        )
            .into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let document = match SignedDocument::decode(content_type, &body) {
        Ok(document) => document,
        Err(e) => return plain(envelope_status(&e), format!("{}\n", e)),
    };

    let signer = match state.keyring.verify(&document.document, &document.signature) {
        Ok(signer) => signer,
        Err(e) => {
            warn!("Rejected upload: {}", e);
            return plain(
                StatusCode::FORBIDDEN,
                "Failed to validate signature\n".to_string(),
            );
        }
    };
    info!("Good signature from key {}", signer);

    let config = match Config::parse(&document.document) {
        Ok(config) => config,
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("{}\n", e)),
    };

    if let Err(e) = state.sink.apply(&config).await {
        error!("Failed to apply uploaded configuration: {}", e);
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to apply new config\n".to_string(),
        );
    }

    plain(StatusCode::OK, "OK\r\n".to_string())
}
