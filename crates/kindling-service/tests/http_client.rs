use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kindling_crypto::prekeys::generate_pre_key_records;
use kindling_crypto::{Identity, IdentityKeyPair, SignedPreKeyRecord};
use kindling_service::{
    AccountServiceClient, ChatServiceAuth, HttpAccountServiceClient, PreKeyEntity, ServiceCredentials,
    ServiceError, SetKeysRequest,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Recorded {
    uploads: Vec<(String, Value, Option<String>)>,
    count_auth: Vec<Option<String>>,
}

#[derive(Clone, Default)]
struct MockServer {
    recorded: Arc<Mutex<Recorded>>,
    reject_pni: bool,
}

fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn get_counts(
    State(server): State<MockServer>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    server.recorded.lock().unwrap().count_auth.push(auth_header(&headers));
    match params.get("identity").map(String::as_str) {
        Some("pni") => Json(json!({ "count": 3, "pqCount": 0 })),
        _ => Json(json!({ "count": 42, "pqCount": 17 })),
    }
}

async fn put_keys(
    State(server): State<MockServer>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let identity = params.get("identity").cloned().unwrap_or_default();
    if server.reject_pni && identity == "pni" {
        return StatusCode::FORBIDDEN;
    }
    server
        .recorded
        .lock()
        .unwrap()
        .uploads
        .push((identity, body, auth_header(&headers)));
    StatusCode::NO_CONTENT
}

async fn spawn(server: MockServer) -> String {
    let app = Router::new()
        .route("/v2/keys", get(get_counts).put(put_keys))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn credentials() -> ServiceCredentials {
    ServiceCredentials {
        username: "aci-uuid.1".into(),
        password: "secret".into(),
    }
}

fn basic(credentials: &ServiceCredentials) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", credentials.username, credentials.password))
    )
}

#[tokio::test]
async fn fetches_counts_per_identity() {
    let server = MockServer::default();
    let base = spawn(server.clone()).await;
    let client =
        HttpAccountServiceClient::new(base, Some(credentials()), Duration::from_secs(5)).unwrap();

    let aci = client.get_pre_key_counts(Identity::Aci).await.unwrap();
    assert_eq!((aci.ec, aci.pq), (42, 17));
    let pni = client.get_pre_key_counts(Identity::Pni).await.unwrap();
    assert_eq!((pni.ec, pni.pq), (3, 0));

    let recorded = server.recorded.lock().unwrap();
    assert_eq!(recorded.count_auth[0], Some(basic(&credentials())));
}

#[tokio::test]
async fn uploads_public_material_with_explicit_auth() {
    let server = MockServer::default();
    let base = spawn(server.clone()).await;
    let client = HttpAccountServiceClient::new(base, None, Duration::from_secs(5)).unwrap();

    let identity = IdentityKeyPair::generate();
    let signed = SignedPreKeyRecord::generate(77, &identity, 0);
    let one_time = generate_pre_key_records(500, 2);
    let request = SetKeysRequest {
        signed_pre_key: Some((&signed).into()),
        pre_keys: Some(one_time.iter().map(PreKeyEntity::from).collect()),
        ..SetKeysRequest::default()
    };
    let explicit = ServiceCredentials {
        username: "new-account".into(),
        password: "registration-password".into(),
    };

    client
        .set_pre_keys(
            Identity::Aci,
            &request,
            &ChatServiceAuth::Explicit(explicit.clone()),
        )
        .await
        .unwrap();

    let recorded = server.recorded.lock().unwrap();
    let (identity_param, body, auth) = &recorded.uploads[0];
    assert_eq!(identity_param, "aci");
    assert_eq!(auth.as_deref(), Some(basic(&explicit).as_str()));
    assert_eq!(body["signedPreKey"]["keyId"], 77);
    assert_eq!(body["preKeys"].as_array().unwrap().len(), 2);
    assert!(body.get("pqLastResortPreKey").is_none());
    assert_eq!(
        body["signedPreKey"]["publicKey"],
        Value::String(STANDARD.encode(signed.public_key()))
    );
}

#[tokio::test]
async fn forbidden_is_reported_with_status() {
    let server = MockServer {
        reject_pni: true,
        ..MockServer::default()
    };
    let base = spawn(server).await;
    let client =
        HttpAccountServiceClient::new(base, Some(credentials()), Duration::from_secs(5)).unwrap();

    let identity = IdentityKeyPair::generate();
    let request = SetKeysRequest {
        signed_pre_key: Some((&SignedPreKeyRecord::generate(1, &identity, 0)).into()),
        ..SetKeysRequest::default()
    };
    let err = client
        .set_pre_keys(Identity::Pni, &request, &ChatServiceAuth::Implicit)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(403));
    assert!(!err.is_network_failure());
}

#[tokio::test]
async fn unreachable_server_is_a_network_failure() {
    // Bind then drop to get a port nothing is listening on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
        HttpAccountServiceClient::new(format!("http://{addr}"), None, Duration::from_secs(5))
            .unwrap();
    let err = client.get_pre_key_counts(Identity::Aci).await.unwrap_err();
    assert!(matches!(err, ServiceError::Network(_)), "got {err:?}");
}
