//! Grove, puller and pusher talking over real loopback HTTP

use shunt_config::{callback, Config, ReloadTrigger, Source, SourceError, SourceEvent};
use shunt_signed::{
    keyring, push, upload_router, FileApplier, Grove, HttpSource, KeyRing, PullOptions,
    PushError, UploadState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const FIRST: &str = "ports:\n  - listen: { addr: \":9001\" }\n    connect: { addr: \"127.0.0.1:9101\" }\n";
const SECOND: &str = "ports:\n  - listen: { addr: \":9001\" }\n    connect: { addr: \"127.0.0.1:9102\" }\n";

async fn serve(router: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn next(rx: &mut mpsc::UnboundedReceiver<SourceEvent>) -> SourceEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no event delivered")
        .expect("channel closed")
}

fn recorder() -> (shunt_config::Callback, mpsc::UnboundedReceiver<SourceEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb = callback(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });
    (cb, rx)
}

fn fast() -> PullOptions {
    PullOptions {
        backoff_unit: Duration::from_millis(20),
        request_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn test_puller_follows_grove_changes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("shunt.yaml");
    std::fs::write(&path, FIRST).unwrap();

    let key = keyring::generate();
    let grove = Grove::new(&path, key.clone());
    grove.start();
    let addr = serve(grove.router()).await;

    let source = HttpSource::with_options(
        format!("http://{}/config", addr),
        KeyRing::new(vec![key.verifying_key()]),
        fast(),
        Arc::new(shunt_config::NoopSourceMetrics),
    );
    let (cb, mut rx) = recorder();
    source.watch(cb).await;
    source.start();

    let first = next(&mut rx).await.unwrap();
    assert_eq!(*first, Config::parse(FIRST.as_bytes()).unwrap());

    std::fs::write(&path, SECOND).unwrap();
    let second = next(&mut rx).await.unwrap();
    assert_eq!(*second, Config::parse(SECOND.as_bytes()).unwrap());
    assert_eq!(source.current().unwrap(), second);

    source.stop().await;
    grove.stop().await;
}

#[tokio::test]
async fn test_puller_reports_untrusted_grove() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("shunt.yaml");
    std::fs::write(&path, FIRST).unwrap();

    let grove = Grove::new(&path, keyring::generate());
    let addr = serve(grove.router()).await;

    let source = HttpSource::with_options(
        format!("http://{}/config", addr),
        KeyRing::new(vec![keyring::generate().verifying_key()]),
        fast(),
        Arc::new(shunt_config::NoopSourceMetrics),
    );
    let (cb, mut rx) = recorder();
    source.watch(cb).await;
    source.start();

    assert!(matches!(next(&mut rx).await, Err(SourceError::Signature(_))));
    assert!(source.current().is_none());
    source.stop().await;
}

#[tokio::test]
async fn test_puller_retries_unreachable_grove_silently() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let source = HttpSource::with_options(
        format!("http://{}/config", addr),
        KeyRing::new(vec![keyring::generate().verifying_key()]),
        fast(),
        Arc::new(shunt_config::NoopSourceMetrics),
    );
    let (cb, mut rx) = recorder();
    source.watch(cb).await;
    source.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    timeout(Duration::from_secs(5), source.stop()).await.unwrap();
}

#[tokio::test]
async fn test_grove_rejects_invalid_wait() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("shunt.yaml");
    std::fs::write(&path, FIRST).unwrap();

    let grove = Grove::new(&path, keyring::generate());
    let addr = serve(grove.router()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/config?wait=maybe", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = client
        .get(format!("http://{}/config", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let etag = response.headers()["etag"].to_str().unwrap().to_string();
    assert!(response.headers().contains_key("last-modified"));

    let response = client
        .get(format!("http://{}/config", addr))
        .header("if-none-match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 304);
}

#[tokio::test]
async fn test_push_rewrites_file_and_fires_trigger() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("shunt.yaml");
    std::fs::write(&path, FIRST).unwrap();

    let key = keyring::generate();
    let trigger = ReloadTrigger::new();
    let source = shunt_config::FileSource::new(&path, trigger.clone());
    let (cb, mut rx) = recorder();
    source.watch(cb).await;
    source.start();
    assert_eq!(
        *next(&mut rx).await.unwrap(),
        Config::parse(FIRST.as_bytes()).unwrap()
    );

    let state = UploadState::new(
        KeyRing::new(vec![key.verifying_key()]),
        Arc::new(FileApplier::new(&path, trigger)),
    );
    let addr = serve(upload_router(state)).await;
    let url = format!("http://{}/upload", addr);
    let client = reqwest::Client::new();

    let second = Config::parse(SECOND.as_bytes()).unwrap();
    let outcome = push(&client, &url, &second, &key).await.unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "OK\r\n");
    assert_eq!(*next(&mut rx).await.unwrap(), second);
    assert!(dir.path().join("shunt.yaml~").exists());

    let rejected = push(&client, &url, &second, &keyring::generate()).await;
    assert!(matches!(rejected, Err(PushError::Rejected { status: 403, .. })));

    source.stop().await;
}
