//! Pusher: sign a configuration and post it to a running instance's upload endpoint

use ed25519_dalek::SigningKey;
use reqwest::header::CONTENT_TYPE;
use shunt_config::{Config, ConfigError};
use thiserror::Error;
use tracing::{debug, info};

use crate::envelope::{random_boundary, SignedDocument};

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upload rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Response from an accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub status: u16,
    pub body: String,
}

/// Serialize `config`, sign it, and post the envelope to `url`
pub async fn push(
    client: &reqwest::Client,
    url: &str,
    config: &Config,
    key: &SigningKey,
) -> Result<PushOutcome, PushError> {
    let document = SignedDocument::sign(config.serialize()?, key);
    let boundary = random_boundary();
    let body = document.encode(&boundary);
    debug!("Pushing {} byte envelope to {}", body.len(), url);

    let response = client
        .post(url)
        .header(CONTENT_TYPE, SignedDocument::content_type(&boundary))
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(PushError::Rejected {
            status: status.as_u16(),
            body: body.trim_end().to_string(),
        });
    }

    info!("Upload accepted: {}", status);
    Ok(PushOutcome {
        status: status.as_u16(),
        body,
    })
}
