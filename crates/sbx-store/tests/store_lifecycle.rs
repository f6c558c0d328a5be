//! End-to-end lifecycle scenarios against the sandbox store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sbx_store::{
    Expirable, RemoveAction, Removal, Sandbox, SandboxRemover, SandboxSpec, SandboxState,
    SandboxStore, StoreError, StoreHooks,
};

struct NoopHooks;

#[async_trait]
impl StoreHooks for NoopHooks {
    fn on_insert(&self, _sandbox: &Sandbox) {}
    async fn on_insert_background(&self, _sandbox: Sandbox) {}
    async fn on_created(&self, _sandbox: Sandbox) {}
}

fn spec(sandbox_id: &str, team_id: Uuid) -> SandboxSpec {
    SandboxSpec {
        sandbox_id: sandbox_id.to_string(),
        template_id: "tmpl-base".to_string(),
        base_template_id: "tmpl-base".to_string(),
        build_id: "build-1".to_string(),
        kernel_version: "6.1".to_string(),
        firecracker_version: "1.7".to_string(),
        envd_version: "0.2".to_string(),
        node_id: "node-1".to_string(),
        cluster_id: Uuid::nil(),
        team_id,
        client_id: "client-1".to_string(),
        envd_access_token: "envd-token".to_string(),
        traffic_access_token: "traffic-token".to_string(),
        vcpu: 2,
        ram_mb: 512,
        disk_mb: 1024,
        auto_pause: false,
        allow_internet_access: true,
        max_instance_length: Duration::hours(24),
        metadata: HashMap::new(),
    }
}

fn store_with(ids: &[&str], team_id: Uuid) -> Arc<SandboxStore> {
    let store = SandboxStore::new(Arc::new(NoopHooks));
    let now = Utc::now();
    for id in ids {
        let sandbox = Sandbox::running(spec(id, team_id), now, now + Duration::hours(1));
        store.add(sandbox, false).unwrap();
    }
    store
}

#[tokio::test]
async fn happy_path_pause_then_kill() {
    let store = store_with(&["sbx-a"], Uuid::new_v4());
    let cancel = CancellationToken::new();

    let handle = match store
        .start_removing(&cancel, "sbx-a", RemoveAction::Pause)
        .await
        .unwrap()
    {
        Removal::Started(handle) => handle,
        Removal::AlreadyDone => panic!("expected a fresh transition"),
    };
    assert_eq!(store.get("sbx-a", true).unwrap().state(), SandboxState::Pausing);

    handle.finish(Ok(()));
    assert_eq!(store.get("sbx-a", true).unwrap().state(), SandboxState::Pausing);

    match store
        .start_removing(&cancel, "sbx-a", RemoveAction::Pause)
        .await
        .unwrap()
    {
        Removal::AlreadyDone => {}
        Removal::Started(_) => panic!("pause already done"),
    }

    match store
        .start_removing(&cancel, "sbx-a", RemoveAction::Kill)
        .await
        .unwrap()
    {
        Removal::Started(handle) => handle.finish(Ok(())),
        Removal::AlreadyDone => panic!("kill should run from pausing"),
    }
    assert_eq!(store.get("sbx-a", true).unwrap().state(), SandboxState::Killing);
}

#[tokio::test]
async fn concurrent_pause_elects_one_owner() {
    let store = store_with(&["sbx-race"], Uuid::new_v4());
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            match store
                .start_removing(&cancel, "sbx-race", RemoveAction::Pause)
                .await
                .unwrap()
            {
                Removal::Started(handle) => {
                    // hold the transition briefly so the others queue up
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    handle.finish(Ok(()));
                    "owner"
                }
                Removal::AlreadyDone => "waiter",
            }
        }));
    }

    let mut owners = 0;
    let mut waiters = 0;
    for task in tasks {
        match task.await.unwrap() {
            "owner" => owners += 1,
            _ => waiters += 1,
        }
    }
    assert_eq!(owners, 1);
    assert_eq!(waiters, 2);
    assert_eq!(
        store.get("sbx-race", true).unwrap().state(),
        SandboxState::Pausing
    );
}

#[tokio::test]
async fn transition_error_parks_sandbox_in_failed() {
    let store = store_with(&["sbx-fail"], Uuid::new_v4());
    let cancel = CancellationToken::new();

    match store
        .start_removing(&cancel, "sbx-fail", RemoveAction::Pause)
        .await
        .unwrap()
    {
        Removal::Started(handle) => handle.finish(Err(anyhow::anyhow!("node rpc failed"))),
        Removal::AlreadyDone => panic!("expected a fresh transition"),
    }

    assert_eq!(
        store.get("sbx-fail", true).unwrap().state(),
        SandboxState::Failed
    );
    assert!(matches!(
        store
            .start_removing(&cancel, "sbx-fail", RemoveAction::Kill)
            .await,
        Err(StoreError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn wait_times_out_while_transition_is_in_flight() {
    let store = store_with(&["sbx-wait"], Uuid::new_v4());
    let cancel = CancellationToken::new();

    let handle = match store
        .start_removing(&cancel, "sbx-wait", RemoveAction::Pause)
        .await
        .unwrap()
    {
        Removal::Started(handle) => handle,
        Removal::AlreadyDone => panic!("expected a fresh transition"),
    };

    let waiter_cancel = CancellationToken::new();
    {
        let waiter_cancel = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            waiter_cancel.cancel();
        });
    }

    let started = Instant::now();
    let result = store
        .wait_for_state_change(&waiter_cancel, "sbx-wait")
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert!(elapsed >= std::time::Duration::from_millis(10));
    assert!(elapsed < std::time::Duration::from_millis(100));

    // the transition itself still completes normally
    handle.finish(Ok(()));
    store
        .wait_for_state_change(&CancellationToken::new(), "sbx-wait")
        .await
        .unwrap();
}

#[tokio::test]
async fn quota_admits_after_release() {
    let store = store_with(&[], Uuid::new_v4());
    let team = Uuid::new_v4();

    let first = store.reserve("sbx-1", team, 1).unwrap();
    match store.reserve("sbx-2", team, 1) {
        Err(StoreError::LimitExceeded { team_id }) => assert_eq!(team_id, team),
        other => panic!("expected LimitExceeded, got {:?}", other.map(|_| ())),
    }

    first.release();
    store.reserve("sbx-2", team, 1).unwrap();
}

#[tokio::test]
async fn live_sandboxes_count_against_quota() {
    let team = Uuid::new_v4();
    let store = store_with(&["sbx-live"], team);

    match store.reserve("sbx-next", team, 1) {
        Err(StoreError::LimitExceeded { .. }) => {}
        other => panic!("expected LimitExceeded, got {:?}", other.map(|_| ())),
    }
    store.reserve("sbx-next", team, 2).unwrap();
}

struct KillingRemover {
    removals: AtomicUsize,
}

#[async_trait]
impl SandboxRemover for KillingRemover {
    async fn remove(&self, sandbox: Sandbox) {
        let cancel = CancellationToken::new();
        match sandbox.start_removing(&cancel, RemoveAction::Kill).await {
            Ok(Removal::Started(handle)) => {
                handle.finish(Ok(()));
                self.removals.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Removal::AlreadyDone) => {}
            Err(error) => panic!("eviction could not transition: {error}"),
        }
    }
}

#[tokio::test]
async fn expired_sandbox_is_evicted_through_the_state_machine() {
    let store = store_with(&["sbx-evict"], Uuid::new_v4());
    let cancel = CancellationToken::new();
    let remover = Arc::new(KillingRemover {
        removals: AtomicUsize::new(0),
    });

    store.start_eviction(cancel.clone(), remover.clone());

    store.get("sbx-evict", false).unwrap().mark_expired();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if remover.removals.load(Ordering::SeqCst) == 1
            && store.get("sbx-evict", true).is_err()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sandbox was never evicted"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cancel.cancel();
}
