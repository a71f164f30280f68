// ABOUTME: Concurrency tests for the pooled-session claim against a file-backed database
// ABOUTME: Many connections race to claim a smaller number of pooled sessions

use lab_storage::{SessionStatus, Storage};
use std::collections::HashSet;

async fn file_storage(dir: &tempfile::TempDir) -> Storage {
    let url = format!("sqlite://{}", dir.path().join("claims.db").display());
    let storage = Storage::connect(&url).await.expect("connect");
    storage.migrate().await.expect("migrate");
    storage.create_project("p1", "Claims").await.expect("project");
    storage
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_hand_out_each_session_once() {
    let dir = tempfile::tempdir().unwrap();
    let storage = file_storage(&dir).await;

    const POOLED: usize = 3;
    const CLAIMERS: usize = 10;

    for _ in 0..POOLED {
        storage
            .create_session("p1", SessionStatus::Pooled, None)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..CLAIMERS {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.claim_pooled_session("p1").await
        }));
    }

    let mut claimed = Vec::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Some(session) => claimed.push(session.id),
            None => empty += 1,
        }
    }

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), POOLED);
    assert_eq!(unique.len(), POOLED);
    assert_eq!(empty, CLAIMERS - POOLED);
    assert_eq!(storage.count_pooled_sessions("p1").await.unwrap(), 0);

    storage.close().await;
}

#[tokio::test]
async fn test_claims_are_scoped_to_project() {
    let dir = tempfile::tempdir().unwrap();
    let storage = file_storage(&dir).await;
    storage.create_project("p2", "Other").await.unwrap();
    storage
        .create_session("p2", SessionStatus::Pooled, None)
        .await
        .unwrap();

    assert!(storage.claim_pooled_session("p1").await.unwrap().is_none());
    assert!(storage.claim_pooled_session("p2").await.unwrap().is_some());
}
