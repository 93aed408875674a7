use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use almanac::config::ApiSettings;
use almanac::infra::http::HttpTransport;
use almanac::sync::{
    ListParams, QueryStatus, Record, Resource, SessionState, StatusChange, SyncClient,
    SyncConfig, SyncError, actions,
};
use almanac_api_types::AccountStatus;
use axum::{
    Json, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

const TOKEN: &str = "t0k3n";

fn seller_json(status: &str) -> Value {
    json!({
        "id": "S1",
        "business_name": "S1 Crystals",
        "owner_name": "Meera",
        "email": "s1@example.com",
        "status": status,
        "product_count": 4
    })
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
}

fn client(addr: SocketAddr, max_retries: u32) -> SyncClient {
    let transport = HttpTransport::new(&ApiSettings {
        base_url: Url::parse(&format!("http://{addr}/api/")).expect("base url"),
        token: Some(TOKEN.to_string()),
        timeout: Duration::from_secs(5),
        max_retries,
        retry_backoff: Duration::from_millis(1),
    })
    .expect("transport");
    SyncClient::new(SyncConfig::default(), Arc::new(transport))
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

#[tokio::test]
async fn list_query_sends_filters_and_token() {
    let app = Router::new().route(
        "/api/sellers",
        get(
            |headers: HeaderMap, Query(query): Query<HashMap<String, String>>| async move {
                if !authorized(&headers) {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"message": "no token"})));
                }
                assert_eq!(query.get("status").map(String::as_str), Some("pending"));
                (
                    StatusCode::OK,
                    Json(json!({"items": [seller_json("pending")], "total": 1, "page": 1})),
                )
            },
        ),
    );
    let client = client(serve(app).await, 0);

    let key = Resource::Sellers.list_key(&ListParams::with_status("pending"));
    let state = client.query(&key).await.expect("resolvable key");

    assert_eq!(state.status, QueryStatus::Success, "{:?}", state.error);
    let record = state
        .data
        .as_ref()
        .and_then(|data| data.record("S1"))
        .expect("seller decoded");
    assert_eq!(
        record.status(),
        StatusChange::Account(AccountStatus::Pending)
    );
}

#[tokio::test]
async fn unauthorized_response_requests_reauthentication() {
    let app = Router::new().route(
        "/api/users/{id}",
        get(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"message": "token expired"})),
            )
        }),
    );
    let client = client(serve(app).await, 3);
    let mut session = client.session();

    let key = Resource::Users.detail_key("u1").expect("key");
    let state = client.query(&key).await.expect("resolvable key");

    match state.error {
        Some(SyncError::AuthExpired { message }) => assert_eq!(message, "token expired"),
        other => panic!("expected an expired session, got {other:?}"),
    }
    session.changed().await.expect("session signal");
    assert_eq!(*session.borrow(), SessionState::ReauthRequired);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/api/blogs/{id}",
        get(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"message": "busy"})));
                }
                (
                    StatusCode::OK,
                    Json(json!({"id": "b1", "title": "Mercury retrograde", "author": "Vidya", "status": "draft"})),
                )
            }
        }),
    );
    let client = client(serve(app).await, 2);

    let key = Resource::Blogs.detail_key("b1").expect("key");
    let state = client.query(&key).await.expect("resolvable key");

    assert_eq!(state.status, QueryStatus::Success, "{:?}", state.error);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn validation_errors_are_final_and_carry_the_server_message() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/api/users/{id}",
        axum::routing::delete(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"message": "user has open orders", "code": "has_orders"})),
                )
            }
        }),
    );
    let client = client(serve(app).await, 3);

    let err = actions::delete(Resource::Users, "u1")
        .submit(&client)
        .await
        .expect_err("server rejects the delete");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(err.user_message(), "user has open orders");
    assert!(matches!(err, SyncError::MutationFailed { .. }));
}

#[tokio::test]
async fn status_action_posts_to_the_record_route() {
    let app = Router::new().route(
        "/api/sellers/{id}/status",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            assert!(authorized(&headers));
            let status = body["status"].as_str().unwrap_or_default().to_string();
            (StatusCode::OK, Json(seller_json(&status)))
        }),
    );
    let client = client(serve(app).await, 0);

    let outcome = actions::set_status(
        Resource::Sellers,
        "S1",
        StatusChange::Account(AccountStatus::Active),
    )
    .submit(&client)
    .await
    .expect("confirmed");

    match outcome.record {
        Some(Record::Seller(seller)) => assert_eq!(seller.status, AccountStatus::Active),
        other => panic!("expected the updated seller, got {other:?}"),
    }
}
