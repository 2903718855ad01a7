//! HTTP-level tests for the reqwest transport

use certpilot_acme::*;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn ca_server() -> MockServer {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/dir"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "newNonce": format!("{base}/new-nonce"),
            "newAccount": format!("{base}/new-acct"),
            "newOrder": format!("{base}/new-order"),
            "meta": { "termsOfService": format!("{base}/tos") }
        })))
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/new-nonce"))
        .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "nonce-from-head"))
        .mount(&server)
        .await;

    server
}

async fn transport(server: &MockServer) -> HttpTransport {
    let config = AcmeConfig::new(
        format!("{}/dir", server.uri()),
        vec!["admin@example.test".to_string()],
        vec!["example.test".to_string()],
    );
    HttpTransport::connect(&config).await.unwrap()
}

fn account_key() -> KeyPair {
    KeyMaterialProvider::new()
        .generate_key_pair(Curve::P256)
        .unwrap()
}

fn bad_nonce() -> ResponseTemplate {
    ResponseTemplate::new(400)
        .insert_header("Replay-Nonce", "fresh-nonce")
        .set_body_json(json!({
            "type": BAD_NONCE,
            "detail": "JWS has an invalid anti-replay nonce"
        }))
}

#[tokio::test]
async fn test_connect_resolves_directory() {
    let server = ca_server().await;
    let transport = transport(&server).await;

    let directory = transport.directory().await.unwrap();
    assert_eq!(directory.new_account, format!("{}/new-acct", server.uri()));
    assert!(directory.terms_of_service().is_some());
}

#[tokio::test]
async fn test_directory_not_found() {
    let server = MockServer::start().await;
    let config = AcmeConfig::new(format!("{}/dir", server.uri()), vec![], vec![]);

    let err = HttpTransport::connect(&config).await.unwrap_err();
    assert!(matches!(err, AcmeError::InvalidDirectory(_)));
}

#[tokio::test]
async fn test_new_account_created() {
    let server = ca_server().await;
    let account_url = format!("{}/acct/7", server.uri());

    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .and(header("content-type", "application/jose+json"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", account_url.as_str())
                .insert_header("Replay-Nonce", "next")
                .set_body_json(json!({ "status": "valid", "contact": ["mailto:admin@example.test"] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let request = AccountCreate::new(vec!["mailto:admin@example.test".to_string()], true);
    let url = transport.new_account(&account_key(), &request).await.unwrap();

    assert_eq!(url, account_url);
}

#[tokio::test]
async fn test_new_account_already_exists() {
    let server = ca_server().await;
    let account_url = format!("{}/acct/7", server.uri());

    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Location", account_url.as_str())
                .set_body_json(json!({ "status": "valid" })),
        )
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let request = AccountCreate::new(vec!["mailto:admin@example.test".to_string()], true);
    let err = transport.new_account(&account_key(), &request).await.unwrap_err();

    match err {
        AcmeError::AccountAlreadyExists { account_url: url } => assert_eq!(url, account_url),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_bad_nonce_retried_once() {
    let server = ca_server().await;
    let account_url = format!("{}/acct/7", server.uri());

    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(bad_nonce())
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", account_url.as_str()))
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let request = AccountCreate::new(vec!["mailto:admin@example.test".to_string()], true);
    let url = transport.new_account(&account_key(), &request).await.unwrap();
    assert_eq!(url, account_url);

    let posts = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 2);
}

#[tokio::test]
async fn test_bad_nonce_not_retried_twice() {
    let server = ca_server().await;

    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(bad_nonce())
        .expect(2)
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let request = AccountCreate::new(vec!["mailto:admin@example.test".to_string()], true);
    let err = transport.new_account(&account_key(), &request).await.unwrap_err();

    assert!(err.is_problem(BAD_NONCE));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_problem_document_is_surfaced() {
    let server = ca_server().await;

    Mock::given(method("POST"))
        .and(path("/new-order"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "type": "urn:ietf:params:acme:error:rejectedIdentifier",
            "detail": "example.test is forbidden by policy",
            "status": 403
        })))
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let account = AccountSession {
        url: format!("{}/acct/7", server.uri()),
        key: std::sync::Arc::new(account_key()),
    };
    let request = OrderCreate::new(vec!["example.test".to_string()]);
    let err = transport.new_order(&account, &request).await.unwrap_err();

    match err {
        AcmeError::RequestRejected {
            status,
            problem_type,
            detail,
        } => {
            assert_eq!(status, 403);
            assert_eq!(
                problem_type.as_deref(),
                Some("urn:ietf:params:acme:error:rejectedIdentifier")
            );
            assert!(detail.contains("forbidden by policy"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_certificate_download() {
    let server = ca_server().await;
    let chain = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    Mock::given(method("POST"))
        .and(path("/cert/1"))
        .and(header("accept", "application/pem-certificate-chain"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pem-certificate-chain")
                .set_body_string(chain),
        )
        .mount(&server)
        .await;

    let transport = transport(&server).await;
    let account = AccountSession {
        url: format!("{}/acct/7", server.uri()),
        key: std::sync::Arc::new(account_key()),
    };
    let downloaded = transport
        .certificate(&account, &format!("{}/cert/1", server.uri()))
        .await
        .unwrap();

    assert_eq!(downloaded, chain);
}
