//! Integration tests for the `/auth` subrequest authorization gate.

mod common;

use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum_test::TestServer;
use base64::{engine::general_purpose::STANDARD, Engine};
use gafaelfawr::auth::token::Token;

#[tokio::test]
async fn success_sets_identity_headers() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin", "read:all"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .authorization_bearer(token_data.token.printable())
        .await;

    resp.assert_status_ok();
    assert_eq!(resp.header("X-Auth-Request-User"), "rachel");
    assert_eq!(resp.header("X-Auth-Request-Email"), "rachel@example.com");
    assert_eq!(resp.header("X-Auth-Request-Uid"), "4510");
    assert_eq!(resp.header("X-Auth-Request-Groups"), "admins,science");
    assert_eq!(
        resp.header("X-Auth-Request-Token-Scopes"),
        "exec:admin read:all"
    );
    assert_eq!(
        resp.header("X-Auth-Request-Token"),
        token_data.token.printable().as_str()
    );
}

#[tokio::test]
async fn missing_scope_is_forbidden() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:test")
        .add_query_param("satisfy", "any")
        .authorization_bearer(token_data.token.printable())
        .await;

    resp.assert_status(StatusCode::FORBIDDEN);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["detail"]["type"], "insufficient_scope");
    let challenge = resp.header(WWW_AUTHENTICATE);
    let challenge = challenge.to_str().unwrap();
    assert!(challenge.contains("error=\"insufficient_scope\""));
    assert!(challenge.contains("scope=\"exec:test\""));
}

#[tokio::test]
async fn satisfy_any_accepts_one_matching_scope() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["read:all"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin,read:all")
        .add_query_param("satisfy", "any")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status_ok();

    // satisfy=all (the default) requires every scope.
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin,read:all")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_token_is_unauthorized() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .authorization_bearer("gt-invalid")
        .await;

    resp.assert_status_unauthorized();
    let challenge = resp.header(WWW_AUTHENTICATE);
    assert!(challenge.to_str().unwrap().contains("error=\"invalid_token\""));
    let body: serde_json::Value = resp.json();
    assert_eq!(body["detail"]["type"], "invalid_token");
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .authorization_bearer(Token::generate().printable())
        .await;
    resp.assert_status_unauthorized();
}

#[tokio::test]
async fn missing_token_yields_bare_challenge() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/auth").add_query_param("scope", "exec:admin").await;
    resp.assert_status_unauthorized();
    let challenge = resp.header(WWW_AUTHENTICATE);
    let challenge = challenge.to_str().unwrap();
    assert!(challenge.starts_with("Bearer realm=\"example.com\""));
    assert!(!challenge.contains("error="));
}

#[tokio::test]
async fn basic_auth_carries_the_token_in_either_field() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin"]).await;
    let server = TestServer::new(app).unwrap();
    let printable = token_data.token.printable();

    // Token in the username.
    let credentials = STANDARD.encode(format!("{printable}:x-oauth-basic"));
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_header(AUTHORIZATION, format!("Basic {credentials}"))
        .await;
    resp.assert_status_ok();

    // Token in the password.
    let credentials = STANDARD.encode(format!("x-oauth-basic:{printable}"));
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_header(AUTHORIZATION, format!("Basic {credentials}"))
        .await;
    resp.assert_status_ok();

    // Both fields literal: nothing to treat as the token.
    let credentials = STANDARD.encode("x-oauth-basic:x-oauth-basic");
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_header(AUTHORIZATION, format!("Basic {credentials}"))
        .await;
    resp.assert_status_unauthorized();

    // Neither field literal: ambiguous, also unauthorized.
    let other = Token::generate().printable();
    let credentials = STANDARD.encode(format!("{printable}:{other}"));
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_header(AUTHORIZATION, format!("Basic {credentials}"))
        .await;
    resp.assert_status_unauthorized();
}

#[tokio::test]
async fn basic_auth_type_changes_the_challenge() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_query_param("auth_type", "basic")
        .await;
    resp.assert_status_unauthorized();
    let challenge = resp.header(WWW_AUTHENTICATE);
    assert_eq!(challenge.to_str().unwrap(), "Basic realm=\"example.com\"");
}

#[tokio::test]
async fn notebook_delegation_returns_a_notebook_token() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin", "read:all"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_query_param("notebook", "true")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status_ok();

    let delegated = resp.header("X-Auth-Request-Token");
    let delegated = delegated.to_str().unwrap().to_string();
    assert_ne!(delegated, token_data.token.printable());

    let delegated = Token::parse(&delegated).unwrap();
    let data = state
        .token_service()
        .resolve(&delegated)
        .await
        .unwrap()
        .expect("notebook token resolves");
    assert_eq!(data.username, "rachel");
    assert_eq!(data.scopes, vec!["exec:admin", "read:all"]);

    // The same request hands out the same token.
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_query_param("notebook", "true")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status_ok();
    let second = resp.header("X-Auth-Request-Token");
    assert_eq!(second.to_str().unwrap(), delegated.printable().as_str());
}

#[tokio::test]
async fn internal_delegation_narrows_scopes() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin", "read:all"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .add_query_param("delegate_to", "tap")
        .add_query_param("delegate_scope", "read:all")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status_ok();
    assert_eq!(resp.header("X-Auth-Request-Token-Scopes"), "read:all");

    let delegated = resp.header("X-Auth-Request-Token");
    let delegated = Token::parse(delegated.to_str().unwrap()).unwrap();
    let data = state
        .token_service()
        .resolve(&delegated)
        .await
        .unwrap()
        .expect("internal token resolves");
    assert_eq!(data.scopes, vec!["read:all"]);
}

#[tokio::test]
async fn internal_delegation_rejects_scope_widening() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["read:all"]).await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .get("/auth")
        .add_query_param("scope", "read:all")
        .add_query_param("delegate_to", "tap")
        .add_query_param("delegate_scope", "exec:admin")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn scope_parameter_is_required() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/auth").await;
    resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["detail"]["type"], "validation_failed");
    assert_eq!(body["detail"]["loc"][0], "query");
    assert_eq!(body["detail"]["loc"][1], "scope");
}

#[tokio::test]
async fn revoked_token_is_unauthorized() {
    let (app, state) = common::test_app();
    let token_data = common::create_session_token(&state, &["exec:admin"]).await;
    state
        .token_service()
        .delete_token(&token_data.token.key, "rachel", None)
        .await
        .unwrap();

    let server = TestServer::new(app).unwrap();
    let resp = server
        .get("/auth")
        .add_query_param("scope", "exec:admin")
        .authorization_bearer(token_data.token.printable())
        .await;
    resp.assert_status_unauthorized();
}
