//! `shunt push`, `shunt grove` and `shunt keygen`

use anyhow::{bail, Context, Result};
use shunt_config::Config;
use shunt_signed::{keyring, push, Grove, KeyId, PushError};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::signals::{SignalEvent, Signals};

pub async fn push_config(config: &Path, key: &Path, url: &str) -> Result<()> {
    let document = Config::load(config)
        .with_context(|| format!("Failed to load {}", config.display()))?;
    let key = keyring::load_signing_key(key).context("Failed to load signing key")?;

    let client = reqwest::Client::new();
    match push(&client, url, &document, &key).await {
        Ok(outcome) => {
            println!("{} {}", outcome.status, outcome.body.trim_end());
            Ok(())
        }
        Err(PushError::Rejected { status, body }) => {
            println!("{} {}", status, body);
            bail!("Upload to {} rejected with status {}", url, status)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to upload to {}", url)),
    }
}

pub async fn serve_grove(config: PathBuf, key: &Path, addr: SocketAddr) -> Result<()> {
    let mut signals = Signals::new()?;
    let key = keyring::load_signing_key(key).context("Failed to load signing key")?;
    info!(
        "Signing with key {}",
        KeyId::of(&key.verifying_key())
    );

    let grove = Grove::new(config, key);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind grove listener on {}", addr))?;
    info!(
        "Serving {} on http://{}/config",
        grove.path().display(),
        addr
    );
    grove.start();

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let router = grove.router();
        let token = shutdown.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }
    });

    loop {
        match signals.next().await {
            // The file is polled anyway
            SignalEvent::Reload => {}
            SignalEvent::Shutdown => break,
        }
    }

    // Release long polls before waiting on in-flight requests
    grove.stop().await;
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Grove listener failed: {}", e),
        Err(e) => warn!("Grove listener task failed: {}", e),
    }
    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())
}

/// Write `PREFIX.key` and `PREFIX.pub`, returning the new key's id
pub fn keygen(prefix: &Path) -> Result<KeyId> {
    let key = keyring::generate();
    let public = key.verifying_key();
    let id = KeyId::of(&public);

    let secret_path = with_suffix(prefix, ".key");
    write_secret(
        &secret_path,
        &format!("{}\n", keyring::encode_signing_key(&key)),
    )
    .with_context(|| format!("Failed to write {}", secret_path.display()))?;

    let public_path = with_suffix(prefix, ".pub");
    std::fs::write(
        &public_path,
        format!("# shunt key {}\n{}\n", id, keyring::encode_public_key(&public)),
    )
    .with_context(|| format!("Failed to write {}", public_path.display()))?;

    println!("Wrote {} and {}", secret_path.display(), public_path.display());
    println!("Key id: {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shunt_signed::KeyRing;

    #[test]
    fn test_keygen_writes_loadable_pair() {
        let dir = tempfile::TempDir::new().unwrap();
        let prefix = dir.path().join("ops");

        let id = keygen(&prefix).unwrap();

        let key = keyring::load_signing_key(&dir.path().join("ops.key")).unwrap();
        let ring = KeyRing::load(&dir.path().join("ops.pub")).unwrap();
        assert_eq!(ring.ids(), vec![id]);
        assert_eq!(KeyId::of(&key.verifying_key()), id);

        let signature = keyring::sign(&key, b"ports: []\n");
        assert_eq!(ring.verify(b"ports: []\n", signature.as_bytes()).unwrap(), id);
    }

    #[cfg(unix)]
    #[test]
    fn test_keygen_secret_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        keygen(&dir.path().join("ops")).unwrap();
        let mode = std::fs::metadata(dir.path().join("ops.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_suffix_keeps_dots_in_prefix() {
        assert_eq!(
            with_suffix(Path::new("/etc/shunt/ops.v2"), ".key"),
            PathBuf::from("/etc/shunt/ops.v2.key")
        );
    }

    #[tokio::test]
    async fn test_push_reports_missing_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = push_config(
            &dir.path().join("missing.yaml"),
            &dir.path().join("missing.key"),
            "http://127.0.0.1:1/upload",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }
}
