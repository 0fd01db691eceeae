//! Upload endpoint behavior, driven through the router without a socket

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use ed25519_dalek::SigningKey;
use shunt_config::Config;
use shunt_signed::{keyring, upload_router, ApplyError, ConfigSink, KeyRing, SignedDocument, UploadState};
use std::sync::{Arc, Mutex};
use tower::ServiceExt; // For `oneshot`

const DOCUMENT: &str = "ports:\n  - listen: { addr: \":9001\" }\n    connect: { addr: \"127.0.0.1:9101\" }\n";

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<Config>>,
    fail: bool,
}

#[async_trait]
impl ConfigSink for RecordingSink {
    async fn apply(&self, config: &Config) -> Result<(), ApplyError> {
        if self.fail {
            return Err(ApplyError::Write {
                path: "/read-only/shunt.yaml.NEW".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        self.applied.lock().unwrap().push(config.clone());
        Ok(())
    }
}

fn setup(fail: bool) -> (Router, Arc<RecordingSink>, SigningKey) {
    let key = keyring::generate();
    let sink = Arc::new(RecordingSink {
        fail,
        ..Default::default()
    });
    let state = UploadState::new(KeyRing::new(vec![key.verifying_key()]), sink.clone());
    (upload_router(state), sink, key)
}

fn upload(content_type: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .uri("/upload")
        .method("POST")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

fn signed(document: &str, key: &SigningKey) -> Request<Body> {
    let envelope = SignedDocument::sign(document.as_bytes().to_vec(), key);
    upload(
        &SignedDocument::content_type("xyzzy"),
        envelope.encode("xyzzy"),
    )
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_valid_upload_is_applied() {
    let (app, sink, key) = setup(false);

    let response = app.oneshot(signed(DOCUMENT, &key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK\r\n");

    let applied = sink.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0], Config::parse(DOCUMENT.as_bytes()).unwrap());
}

#[tokio::test]
async fn test_options_and_wrong_method() {
    let (app, _sink, _key) = setup(false);

    let request = Request::builder()
        .uri("/upload")
        .method("OPTIONS")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ALLOW], "POST");

    let request = Request::builder()
        .uri("/upload")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "POST");
}

#[tokio::test]
async fn test_bad_content_types() {
    let (app, sink, _key) = setup(false);

    let response = app
        .clone()
        .oneshot(upload("application/json", b"{}".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app
        .clone()
        .oneshot(upload("multipart/signed", b"".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.oneshot(upload("nonsense", b"".to_vec())).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(sink.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_untrusted_signature_is_forbidden() {
    let (app, sink, _key) = setup(false);
    let stranger = keyring::generate();

    let response = app.oneshot(signed(DOCUMENT, &stranger)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(sink.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tampered_document_is_forbidden() {
    let (app, sink, key) = setup(false);

    let mut envelope = SignedDocument::sign(DOCUMENT.as_bytes().to_vec(), &key);
    envelope.document = DOCUMENT.replace("9101", "9999").into_bytes();
    let response = app
        .oneshot(upload(
            &SignedDocument::content_type("b"),
            envelope.encode("b"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(sink.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unparseable_document_is_bad_request() {
    let (app, sink, key) = setup(false);

    let response = app.oneshot(signed("ports: {bogus", &key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(sink.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_apply_failure_is_server_error() {
    let (app, _sink, key) = setup(true);

    let response = app.oneshot(signed(DOCUMENT, &key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
