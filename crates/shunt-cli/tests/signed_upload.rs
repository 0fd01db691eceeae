//! A signed upload on the admin listener reconfigures a running daemon

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use shunt_cli::admin::admin_router;
use shunt_cli::run::{select_source, RunOptions};
use shunt_cli::tools::keygen;
use shunt_config::{Address, Config, ForwardingRule};
use shunt_proxy::{Daemon, MetricsRegistry};
use shunt_signed::{keyring, SignedDocument};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt; // For `oneshot`

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_upload_opens_port_on_running_daemon() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("shunt.yaml");
    std::fs::write(&config_path, "ports: []\n").unwrap();
    keygen(&dir.path().join("ops")).unwrap();
    let key = keyring::load_signing_key(&dir.path().join("ops.key")).unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let selected = select_source(
        &RunOptions {
            config: Some(config_path.clone()),
            keyring: Some(dir.path().join("ops.pub")),
            ..Default::default()
        },
        metrics.clone(),
    )
    .unwrap();
    assert!(selected.upload.is_some());

    let daemon = Daemon::start(selected.source, metrics.clone()).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while !metrics.render().contains("shunt_config_successes_total 1") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("initial configuration never loaded");
    assert!(daemon.running().await.is_empty());

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let listen_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = Config::new(vec![ForwardingRule::new(
        "web",
        Address::tcp(format!("127.0.0.1:{}", listen_port)),
        Address::tcp(format!("127.0.0.1:{}", backend_port)),
    )]);
    let envelope = SignedDocument::sign(config.serialize().unwrap(), &key);

    let app = admin_router(metrics.clone(), selected.upload);
    let request = Request::builder()
        .uri("/upload")
        .method("POST")
        .header(header::CONTENT_TYPE, SignedDocument::content_type("cafe"))
        .body(Body::from(envelope.encode("cafe")))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK\r\n");

    let running = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let running = daemon.running().await;
            if !running.is_empty() {
                return running;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("daemon never picked up the upload");
    assert_eq!(running[0].name, "web");

    assert_eq!(
        Config::load(&config_path).unwrap(),
        config,
        "upload should rewrite the configuration file"
    );

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let text = body_text(response).await;
    assert!(text.contains("shunt_restarts_total{port=\"web\"} 1"));
    assert!(text.contains("shunt_config_successes_total 2"));

    daemon.stop().await;
}

#[tokio::test]
async fn test_upload_signed_by_stranger_changes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("shunt.yaml");
    std::fs::write(&config_path, "ports: []\n").unwrap();
    keygen(&dir.path().join("ops")).unwrap();

    let metrics = Arc::new(MetricsRegistry::new());
    let selected = select_source(
        &RunOptions {
            config: Some(config_path.clone()),
            keyring: Some(dir.path().join("ops.pub")),
            ..Default::default()
        },
        metrics.clone(),
    )
    .unwrap();

    let config = Config::new(vec![ForwardingRule::new(
        "",
        Address::tcp("127.0.0.1:1"),
        Address::tcp("127.0.0.1:2"),
    )]);
    let envelope = SignedDocument::sign(config.serialize().unwrap(), &keyring::generate());
    let request = Request::builder()
        .uri("/upload")
        .method("POST")
        .header(header::CONTENT_TYPE, SignedDocument::content_type("cafe"))
        .body(Body::from(envelope.encode("cafe")))
        .unwrap();
    let response = admin_router(metrics, selected.upload)
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "ports: []\n");
    assert!(!dir.path().join("shunt.yaml~").exists());
}
