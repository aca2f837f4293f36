mod common;
use common::setup_server;

use reqwest::StatusCode;
use serde_json::json;
use vote_service::database::Database;

#[tokio::test]
async fn e2e_binary_endpoints() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("votes.db");

    // Seed the file database before the service opens it
    let db = Database::connect(db_path.to_str().unwrap()).await?;
    common::seed(&db).await;
    db.pool().close().await;

    let (base_url, _guard) = setup_server(&db_path).await?;
    let client = reqwest::Client::new();

    // Test GET /healthz
    let health = client.get(format!("{}/healthz", base_url)).send().await?;
    assert!(health.status().is_success());
    assert_eq!(health.text().await?, "ok");

    // Test GET /version
    let version: serde_json::Value = client
        .get(format!("{}/version", base_url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));
    assert!(version["git_hash"].is_string());

    // Ineligible votes are refused before the (unreachable) ledger
    let resp = client
        .post(format!("{}/votes", base_url))
        .json(&json!({
            "voter_id": "v1",
            "candidate_id": "gamma",
            "election_id": "closed",
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["error"], "election_not_open");

    // An eligible vote cannot reach the ledger
    let resp = client
        .post(format!("{}/votes", base_url))
        .json(&json!({
            "voter_id": "v1",
            "candidate_id": "alpha",
            "election_id": "open",
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["error"], "ledger_unavailable");
    let attempt_id = body["attempt_id"].as_str().unwrap().to_string();

    let attempt: serde_json::Value = client
        .get(format!("{}/attempts/{}", base_url, attempt_id))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(attempt["state"], "SUBMISSION_FAILED");

    // Metrics reflect both outcomes and the file size
    let metrics: serde_json::Value = client
        .get(format!("{}/metrics", base_url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let votes = metrics["cast_vote_total"].as_array().unwrap();
    assert!(votes.iter().any(|e| e["outcome"] == "ineligible"));
    assert!(votes.iter().any(|e| e["outcome"] == "ledger_unavailable"));
    assert!(metrics["storage"]["db_size_mb"].is_number());

    Ok(())
}
