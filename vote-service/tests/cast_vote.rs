mod common;

use std::collections::HashSet;

use common::{vote, wallet, Harness};
use vote_service::database::models::{AttemptState, Candidate, VoteAttempt};
use vote_service::error::{Ineligible, VoteError};
use vote_service::ledger::{RpcError, TxHash};

#[tokio::test]
async fn happy_path_records_vote_and_bumps_counters() {
    let h = Harness::new().await;

    let receipt = h.coordinator.cast_vote(&vote("v1", "alpha", "open")).await.unwrap();

    assert_ne!(receipt.transaction_hash, TxHash::default());
    assert_eq!(receipt.candidate_name, "ALPHA");
    assert_eq!(h.candidate_votes("alpha").await, 1);
    assert_eq!(h.election_votes("open").await, 1);

    let record = h
        .coordinator
        .get_vote(&receipt.transaction_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.voter_id, "v1");
    assert_eq!(record.block_number, receipt.block_number);
    assert!(record.is_valid);

    let attempt = h.attempt(receipt.attempt_id).await;
    assert_eq!(attempt.state, AttemptState::Committed);
    assert_eq!(attempt.tx_hash, Some(receipt.transaction_hash));

    // The ledger saw the voter's wallet in the call data
    let sent = h.ledger.transaction(&receipt.transaction_hash).unwrap();
    assert!(sent.request.data.ends_with(&wallet(1).0));
}

#[tokio::test]
async fn second_vote_is_rejected_without_changes() {
    let h = Harness::new().await;
    h.coordinator.cast_vote(&vote("v1", "alpha", "open")).await.unwrap();

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "beta", "open"))
        .await
        .unwrap_err();

    assert!(matches!(err, VoteError::Ineligible(Ineligible::AlreadyVoted)));
    assert_eq!(h.candidate_votes("alpha").await, 1);
    assert_eq!(h.candidate_votes("beta").await, 0);
    assert_eq!(h.election_votes("open").await, 1);
    assert_eq!(h.ledger.send_calls(), 1);
}

#[tokio::test]
async fn closed_election_never_reaches_the_ledger() {
    let h = Harness::new().await;

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "gamma", "closed"))
        .await
        .unwrap_err();

    assert!(matches!(err, VoteError::Ineligible(Ineligible::ElectionNotOpen)));
    assert_eq!(h.ledger.estimate_calls(), 0);
    assert_eq!(h.ledger.send_calls(), 0);
    assert_eq!(h.record_count().await, 0);
}

#[tokio::test]
async fn unverified_voter_and_foreign_candidate_are_rejected() {
    let h = Harness::new().await;

    let err = h
        .coordinator
        .cast_vote(&vote("unverified", "alpha", "open"))
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::Ineligible(Ineligible::VoterNotVerified)));

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "gamma", "open"))
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::Ineligible(Ineligible::CandidateIneligible)));
    assert_eq!(h.ledger.send_calls(), 0);
}

#[tokio::test]
async fn concurrent_votes_for_one_voter_commit_exactly_once() {
    let h = Harness::new().await;

    let first = vote("v1", "alpha", "open");
    let second = vote("v1", "beta", "open");
    let (a, b) = tokio::join!(
        h.coordinator.cast_vote(&first),
        h.coordinator.cast_vote(&second),
    );

    let results = [a, b];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(VoteError::Ineligible(Ineligible::AlreadyVoted))
    )));
    assert_eq!(h.record_count().await, 1);
    assert_eq!(h.election_votes("open").await, 1);
    assert_eq!(h.ledger.transactions().len(), 1);
}

#[tokio::test]
async fn dropped_request_still_commits() {
    let h = Harness::new().await;
    h.ledger.set_manual_mining(true);

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move {
        coordinator.cast_vote(&vote("v1", "alpha", "open")).await
    });
    h.wait_for_transactions(1).await;

    // The caller goes away once the transaction is out
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    h.ledger.mine_pending();

    for _ in 0..200 {
        if h.record_count().await == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(h.record_count().await, 1);
    assert_eq!(h.candidate_votes("alpha").await, 1);
    assert_eq!(h.election_votes("open").await, 1);
    assert_eq!(h.ledger.send_calls(), 1);
}

#[tokio::test]
async fn concurrent_voters_get_distinct_nonces() {
    let h = Harness::new().await;

    let mut tasks = Vec::new();
    for n in 1..=5 {
        let coordinator = h.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .cast_vote(&vote(&format!("v{}", n), "alpha", "open"))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let nonces: HashSet<u64> = h.ledger.transactions().iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, (0..5).collect());
    assert_eq!(h.candidate_votes("alpha").await, 5);
    assert_eq!(h.election_votes("open").await, 5);
}

#[tokio::test]
async fn reverted_transaction_leaves_no_record() {
    let h = Harness::new().await;
    h.ledger.set_reverting(true);

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();

    let VoteError::LedgerRejected {
        attempt_id,
        tx_hash: Some(hash),
        ..
    } = err
    else {
        panic!("expected a ledger rejection with a hash, got {err:?}");
    };
    assert_eq!(h.record_count().await, 0);
    assert_eq!(h.candidate_votes("alpha").await, 0);
    assert_eq!(h.election_votes("open").await, 0);

    let attempt = h.attempt(attempt_id).await;
    assert_eq!(attempt.state, AttemptState::LedgerReverted);
    assert_eq!(attempt.tx_hash, Some(hash));
}

#[tokio::test]
async fn receipt_timeout_reports_pending() {
    let h = Harness::new().await;
    h.ledger.set_manual_mining(true);

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("check back"));
    let VoteError::Pending {
        attempt_id,
        tx_hash: Some(hash),
    } = err
    else {
        panic!("expected a pending vote, got {err:?}");
    };
    assert_eq!(h.record_count().await, 0);
    assert!(h.ledger.transaction(&hash).unwrap().block.is_none());
    assert_eq!(h.attempt(attempt_id).await.state, AttemptState::LedgerTimeout);

    // Still in flight, so a retry from the voter is refused
    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();
    assert!(matches!(err, VoteError::Ineligible(Ineligible::AlreadyVoted)));
    assert_eq!(h.ledger.send_calls(), 1);
}

#[tokio::test]
async fn unreachable_ledger_is_retried_then_reported() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.ledger.fail_next_send(RpcError::Connect("connection refused".into()));
    }

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();

    let VoteError::LedgerUnavailable { attempt_id, .. } = err else {
        panic!("expected an unavailable ledger, got {err:?}");
    };
    assert_eq!(h.ledger.send_calls(), 3);
    assert_eq!(h.attempt(attempt_id).await.state, AttemptState::SubmissionFailed);

    // Nothing reached the chain, so the voter may try again
    let receipt = h.coordinator.cast_vote(&vote("v1", "alpha", "open")).await.unwrap();
    assert_ne!(receipt.attempt_id, attempt_id);
    assert_eq!(h.candidate_votes("alpha").await, 1);
}

#[tokio::test]
async fn node_rejection_is_not_retried() {
    let h = Harness::new().await;
    h.ledger.fail_next_send(RpcError::Node {
        code: -32000,
        message: "insufficient funds for gas * price + value".into(),
    });

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();

    assert!(matches!(err, VoteError::LedgerRejected { tx_hash: None, .. }));
    assert_eq!(h.ledger.send_calls(), 1);
    assert_eq!(h.record_count().await, 0);
}

#[tokio::test]
async fn lost_send_response_is_not_resubmitted() {
    let h = Harness::new().await;
    h.ledger.lose_next_send_response();

    let err = h
        .coordinator
        .cast_vote(&vote("v1", "alpha", "open"))
        .await
        .unwrap_err();

    let VoteError::Pending {
        attempt_id,
        tx_hash: None,
    } = err
    else {
        panic!("expected a pending vote without hash, got {err:?}");
    };
    assert_eq!(h.ledger.send_calls(), 1);
    assert_eq!(h.ledger.transactions().len(), 1);

    let attempt = h.attempt(attempt_id).await;
    assert_eq!(attempt.state, AttemptState::LedgerTimeout);
    assert_eq!(attempt.nonce, Some(0));
    assert!(attempt.from_block.is_some());
}

#[tokio::test]
async fn candidate_withdrawn_after_confirmation_is_orphaned() {
    let h = Harness::new().await;
    h.ledger.set_manual_mining(true);

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move {
        coordinator.cast_vote(&vote("v1", "alpha", "open")).await
    });
    h.wait_for_transactions(1).await;

    {
        let mut conn = h.db.pool().acquire().await.unwrap();
        Candidate::set_active(&mut conn, "alpha", false)
            .await
            .unwrap();
    }
    h.ledger.mine_pending();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, VoteError::Ineligible(Ineligible::CandidateIneligible)));
    assert_eq!(h.record_count().await, 0);

    let mut conn = h.db.pool().acquire().await.unwrap();
    let attempts = VoteAttempt::list_recent(&mut conn, None, 10)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Orphaned);
}
