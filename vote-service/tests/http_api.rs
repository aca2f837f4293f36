mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::Harness;
use vote_service::api::router;
use vote_service::state::AppState;

fn app(h: &Harness) -> Router {
    router(AppState::new(h.db.clone(), h.coordinator.clone()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_vote(voter: &str, candidate: &str, election: &str) -> Request<Body> {
    let body = json!({
        "voter_id": voter,
        "candidate_id": candidate,
        "election_id": election,
    });
    Request::builder()
        .method("POST")
        .uri("/votes")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn vote_then_duplicate() {
    let h = Harness::new().await;

    let (status, body) = send(app(&h), post_vote("v1", "alpha", "open")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["candidate_name"], "ALPHA");
    let hash = body["transaction_hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 66);

    let (status, body) = send(app(&h), post_vote("v1", "beta", "open")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_voted");

    let (status, body) = send(app(&h), get(&format!("/votes/{}", hash))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["voter_id"], "v1");
    assert_eq!(body["is_valid"], true);
}

#[tokio::test]
async fn ineligible_vote_is_bad_request() {
    let h = Harness::new().await;

    let (status, body) = send(app(&h), post_vote("v1", "gamma", "closed")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "election_not_open");
    assert!(body.get("attempt_id").is_none());

    let (status, body) = send(app(&h), post_vote("unverified", "alpha", "open")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "voter_not_verified");
}

#[tokio::test]
async fn ledger_failures_map_to_gateway_errors() {
    let h = Harness::new().await;

    h.ledger.set_reverting(true);
    let (status, body) = send(app(&h), post_vote("v1", "alpha", "open")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "ledger_rejected");
    assert!(body["transaction_hash"].is_string());

    h.ledger.set_reverting(false);
    h.ledger.set_manual_mining(true);
    let (status, body) = send(app(&h), post_vote("v2", "alpha", "open")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "vote_pending");

    // The attempt can be polled while the vote is pending
    let attempt_id = body["attempt_id"].as_str().unwrap().to_string();
    let (status, body) = send(app(&h), get(&format!("/attempts/{}", attempt_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "LEDGER_TIMEOUT");
}

#[tokio::test]
async fn invalidation_round() {
    let h = Harness::new().await;
    let (_, body) = send(app(&h), post_vote("v1", "alpha", "open")).await;
    let hash = body["transaction_hash"].as_str().unwrap().to_string();

    let (status, body) = send(app(&h), post(&format!("/votes/{}/invalidate", hash))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated"], true);
    assert_eq!(h.candidate_votes("alpha").await, 0);
    assert_eq!(h.election_votes("open").await, 0);

    let (status, body) = send(app(&h), post(&format!("/votes/{}/invalidate", hash))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated"], false);
    assert_eq!(h.candidate_votes("alpha").await, 0);
}

#[tokio::test]
async fn lookups_validate_their_input() {
    let h = Harness::new().await;

    let (status, _) = send(app(&h), get("/votes/not-a-hash")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = format!("0x{}", "ab".repeat(32));
    let (status, body) = send(app(&h), get(&format!("/votes/{}", unknown))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(app(&h), post(&format!("/votes/{}/invalidate", unknown))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app(&h), get("/attempts/42")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app(&h), get(&format!("/attempts/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn service_endpoints() {
    let h = Harness::new().await;

    let response = app(&h).oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = send(app(&h), get("/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    send(app(&h), post_vote("v1", "gamma", "closed")).await;
    let (status, body) = send(app(&h), get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cast_vote_total"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["outcome"] == "ineligible"));
    assert_eq!(body["storage"]["db_path"], ":memory:");
}
