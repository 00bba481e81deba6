//! Integration tests for environment lifecycle operations.
//!
//! The manager runs against the in-memory data layer and lock provider with
//! fake collaborators that record what they were asked to do.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{repo_config, revision, test_config, Harness, REPO};
use lifecycle::commit_status::CommitStatus;
use lifecycle::models::{OperationKind, OperationStatus};
use lifecycle::notifications::NotificationEvent;
use lifecycle::{
    CancelReason, DataLayer, DestroyReason, EnvironmentStatus, LifecycleError, ManagerConfig, OpContext,
};
use locker::{lock_key, LockProvider};

fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_builds_environment_and_reports_success() {
    let h = Harness::with_config(ManagerConfig {
        ui_base_url: Some("https://previews.example.com".into()),
        ..test_config()
    });
    let ctx = OpContext::new();

    let name = h.manager.create(&ctx, revision(1, "sha1")).await.unwrap();

    assert_eq!(name, "env-1");
    let env = h.env(&name).await;
    assert_eq!(env.status, EnvironmentStatus::Success);
    assert_eq!(
        h.data.status_history(&name),
        vec![EnvironmentStatus::Spawned, EnvironmentStatus::Success]
    );
    assert_eq!(env.ref_map.get(REPO).map(String::as_str), Some("feature"));
    assert_eq!(env.commit_sha_map.get(REPO).map(String::as_str), Some("abc123"));

    assert_eq!(h.installer.calls(), vec!["install:env-1".to_string()]);
    assert_eq!(
        h.notifier.events(),
        vec![NotificationEvent::CreateEnvironment, NotificationEvent::Success]
    );
    assert_eq!(h.repo.statuses(), vec![CommitStatus::Pending, CommitStatus::Success]);

    let (sha, update) = h.repo.updates().pop().unwrap();
    assert_eq!(sha, "sha1");
    assert_eq!(update.context, "preview");
    assert_eq!(update.description, "Environment env-1 is ready");
    assert_eq!(
        update.target_url,
        format!("https://previews.example.com/ui/event/status?id={}", ctx.id())
    );

    let op = h.data.get_operation(ctx.id()).await.unwrap().unwrap();
    assert_eq!(op.kind, OperationKind::Create);
    assert_eq!(op.status, OperationStatus::Done);
    assert!(op.completed.is_some());
    assert_eq!(
        op.rendered_status.map(|r| r.description),
        Some("Environment env-1 is ready".to_string())
    );

    let scratch = h.metadata.scratch_dirs();
    assert_eq!(scratch.len(), 1);
    assert!(!scratch[0].exists(), "chart scratch directory should be removed");
    assert_eq!(h.metrics.count("env.create_errors"), 0);
    assert_eq!(h.metrics.last_gauge("env.dependencies"), Some(1.0));
}

#[tokio::test]
async fn test_create_with_invalid_config_fails_as_user_error() {
    let h = Harness::new();
    h.metadata.fail_with("bad yaml at line 3");
    let ctx = OpContext::new();

    let err = h.manager.create(&ctx, revision(2, "sha1")).await.unwrap_err();

    assert!(err.is_user_error());
    assert!(!err.is_cancelled());
    assert!(err.to_string().contains("bad yaml at line 3"));
    assert_eq!(h.env("env-1").await.status, EnvironmentStatus::Failure);
    assert!(h.installer.calls().is_empty());
    assert_eq!(h.notifier.events(), vec![NotificationEvent::Failure]);
    assert!(h.notifier.sent()[0].data.error_message.contains("bad yaml at line 3"));
    assert_eq!(h.repo.statuses(), vec![CommitStatus::Failure]);
    assert_eq!(h.metrics.count("env.create_errors"), 1);

    let op = h.data.get_operation(ctx.id()).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
}

#[tokio::test]
async fn test_create_with_failing_chart_marks_failure() {
    let h = Harness::new();
    h.installer.fail_install.store(true, Ordering::SeqCst);

    let err = h.manager.create(&OpContext::new(), revision(3, "sha1")).await.unwrap_err();

    assert!(err.is_user_error());
    assert_eq!(
        h.data.status_history("env-1"),
        vec![EnvironmentStatus::Spawned, EnvironmentStatus::Failure]
    );
    assert_eq!(
        h.notifier.events(),
        vec![NotificationEvent::CreateEnvironment, NotificationEvent::Failure]
    );
    assert_eq!(h.repo.statuses(), vec![CommitStatus::Pending, CommitStatus::Failure]);
}

#[tokio::test]
async fn test_create_reuses_previous_record_for_pull_request() {
    let h = Harness::new();
    h.seed_environment("old-name", 4, EnvironmentStatus::Destroyed, hours(2))
        .await;

    let name = h.manager.create(&OpContext::new(), revision(4, "sha9")).await.unwrap();

    assert_eq!(name, "old-name");
    let env = h.env(&name).await;
    assert_eq!(env.status, EnvironmentStatus::Success);
    assert_eq!(env.source_sha, "sha9");
    assert!(env.created > chrono::Utc::now() - hours(1));
}

// =============================================================================
// Locking, preemption and cancellation
// =============================================================================

#[tokio::test]
async fn test_newer_operation_preempts_running_one() {
    let h = Harness::new();
    h.installer.block_until_cancelled.store(true, Ordering::SeqCst);

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.create(&OpContext::new(), revision(7, "sha1")).await })
    };
    h.installer.started.notified().await;
    h.installer.block_until_cancelled.store(false, Ordering::SeqCst);

    let name = h.manager.update(&OpContext::new(), revision(7, "sha2")).await.unwrap();

    let first = first.await.unwrap().unwrap_err();
    assert!(first.is_cancelled(), "unexpected error: {first}");
    assert!(first.to_string().contains("preempted"));
    assert_eq!(name, "env-1");
    assert_eq!(
        h.data.status_history(&name),
        vec![
            EnvironmentStatus::Spawned,
            EnvironmentStatus::Cancelled,
            EnvironmentStatus::Spawned,
            EnvironmentStatus::Success,
        ]
    );
    assert_eq!(h.env(&name).await.source_sha, "sha2");
    assert_eq!(h.metrics.count("env.lock_preempt"), 1);
    assert_eq!(h.metrics.count("env.update_create"), 1);
    assert_eq!(h.metrics.count("env.create_errors"), 0);
}

#[tokio::test]
async fn test_operations_on_one_pull_request_never_overlap() {
    let h = Harness::new();
    h.installer.set_delay(Duration::from_millis(20));

    let mut handles = Vec::new();
    for i in 0..4 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .update(&OpContext::new(), revision(9, &format!("sha{i}")))
                .await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert!(e.is_cancelled() || e.is_lock_error(), "unexpected error: {e}"),
        }
    }

    assert!(succeeded >= 1);
    assert_eq!(h.installer.max_inside.load(Ordering::SeqCst), 1);
    let extant = h.data.get_extant_environments(REPO, 9).await.unwrap();
    assert_eq!(extant.len(), 1);
}

#[tokio::test]
async fn test_operation_timeout_cancels_with_notification() {
    let h = Harness::with_config(ManagerConfig {
        operation_timeout: Duration::from_millis(100),
        ..test_config()
    });
    h.installer.block_until_cancelled.store(true, Ordering::SeqCst);
    let ctx = OpContext::new();

    let err = h.manager.create(&ctx, revision(10, "sha1")).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.to_string().contains("timeout reached"));
    assert_eq!(
        h.data.status_history("env-1"),
        vec![EnvironmentStatus::Spawned, EnvironmentStatus::Cancelled]
    );
    let failure = h
        .notifier
        .sent()
        .into_iter()
        .find(|n| n.event == NotificationEvent::Failure)
        .unwrap();
    assert!(failure.data.error_message.starts_with("timeout reached"));
    assert_eq!(h.metrics.count("env.create_errors"), 0);

    let op = h.data.get_operation(ctx.id()).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
}

#[tokio::test]
async fn test_caller_cancellation_marks_environment_cancelled() {
    let h = Harness::new();
    h.installer.block_until_cancelled.store(true, Ordering::SeqCst);
    let ctx = OpContext::new();

    let op = {
        let manager = h.manager.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { manager.create(&ctx, revision(11, "sha1")).await })
    };
    h.installer.started.notified().await;
    ctx.cancel(CancelReason::Requested("shutdown".into()));

    let err = op.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.env("env-1").await.status, EnvironmentStatus::Cancelled);
    assert!(!h.locks.is_locked(lock_key(REPO, 11)));
}

#[tokio::test]
async fn test_cancelled_body_stops_writing_after_release() {
    let h = Harness::new();
    h.metadata.delay_get("sha1", Duration::from_millis(500));
    let ctx = OpContext::new();

    let first = {
        let manager = h.manager.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { manager.create(&ctx, revision(12, "sha1")).await })
    };
    h.metadata.get_started.notified().await;
    ctx.cancel(CancelReason::Requested("superseded".into()));
    assert!(first.await.unwrap().unwrap_err().is_cancelled());
    assert!(!h.locks.is_locked(lock_key(REPO, 12)));

    let name = h.manager.update(&OpContext::new(), revision(12, "sha2")).await.unwrap();
    assert_eq!(name, "env-1");

    // outlast the slow metadata fetch of the cancelled create
    tokio::time::sleep(Duration::from_millis(700)).await;

    let env = h.env("env-1").await;
    assert_eq!(env.status, EnvironmentStatus::Success);
    assert_eq!(env.source_sha, "sha2");
    assert_eq!(
        h.data.status_history("env-1"),
        vec![
            EnvironmentStatus::Spawned,
            EnvironmentStatus::Cancelled,
            EnvironmentStatus::Spawned,
            EnvironmentStatus::Success,
        ]
    );
}

#[tokio::test]
async fn test_lock_wait_timeout_is_lock_error() {
    let h = Harness::with_config(ManagerConfig {
        lock_wait: Duration::from_millis(100),
        ..test_config()
    });
    let mut holdout = h.locks.new_lock(lock_key(REPO, 8), "holdout").await.unwrap();
    let _ignored = holdout.lock(Duration::from_secs(1)).await.unwrap();

    let err = h.manager.create(&OpContext::new(), revision(8, "sha1")).await.unwrap_err();

    assert!(err.is_lock_error(), "unexpected error: {err}");
    assert!(h
        .data
        .get_environments_by_repo_and_pr(REPO, 8)
        .await
        .unwrap()
        .is_empty());
    assert!(h.installer.calls().is_empty());
    holdout.unlock().await.unwrap();
}

// =============================================================================
// Global limit
// =============================================================================

#[tokio::test]
async fn test_global_limit_destroys_oldest_before_install() {
    let h = Harness::with_config(ManagerConfig {
        global_limit: 3,
        ..test_config()
    });
    h.seed_environment("old-1", 101, EnvironmentStatus::Success, hours(4))
        .await;
    h.seed_environment("old-2", 102, EnvironmentStatus::Success, hours(3))
        .await;
    h.seed_environment("old-3", 103, EnvironmentStatus::Success, hours(2))
        .await;
    h.seed_environment("old-4", 104, EnvironmentStatus::Success, hours(1))
        .await;

    let name = h.manager.create(&OpContext::new(), revision(1, "sha1")).await.unwrap();

    assert_eq!(h.env("old-1").await.status, EnvironmentStatus::Destroyed);
    assert_eq!(h.env("old-2").await.status, EnvironmentStatus::Destroyed);
    assert_eq!(h.env("old-3").await.status, EnvironmentStatus::Success);
    assert_eq!(h.env("old-4").await.status, EnvironmentStatus::Success);
    assert_eq!(
        h.installer.running_at_install(),
        vec![vec!["old-3".to_string(), "old-4".to_string(), name.clone()]]
    );
    assert_eq!(h.notifier.events_for("old-1"), vec![NotificationEvent::DestroyEnvironment]);
    assert_eq!(h.metrics.count("env.global_limit_exceeded"), 1);
    assert_eq!(h.env(&name).await.status, EnvironmentStatus::Success);
}

#[tokio::test]
async fn test_zero_global_limit_is_disabled() {
    let h = Harness::new();
    for (i, pr) in (201..206).enumerate() {
        h.seed_environment(&format!("old-{i}"), pr, EnvironmentStatus::Success, hours(1))
            .await;
    }

    h.manager.create(&OpContext::new(), revision(1, "sha1")).await.unwrap();

    assert_eq!(h.data.get_running_environments().await.unwrap().len(), 6);
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_update_with_unchanged_config_upgrades_in_place() {
    let h = Harness::new();
    let name = h.manager.create(&OpContext::new(), revision(2, "sha1")).await.unwrap();
    let before = h.cluster_env(&name).await.unwrap();
    let releases_before = h.data.get_helm_releases_for_env(&name).await.unwrap();

    h.manager.update(&OpContext::new(), revision(2, "sha2")).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(
        h.installer.calls(),
        vec!["install:env-1".to_string(), "upgrade:env-1".to_string()]
    );
    assert_eq!(h.installer.delete_attempts.load(Ordering::SeqCst), 0);
    assert_eq!(h.cluster_env(&name).await.unwrap().namespace, before.namespace);
    let releases: Vec<String> = h
        .data
        .get_helm_releases_for_env(&name)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.release)
        .collect();
    assert_eq!(
        releases,
        releases_before.into_iter().map(|r| r.release).collect::<Vec<_>>()
    );
    assert_eq!(h.metrics.count("env.update_in_place"), 1);
    assert_eq!(
        h.notifier.events(),
        vec![
            NotificationEvent::CreateEnvironment,
            NotificationEvent::Success,
            NotificationEvent::UpdateEnvironment,
            NotificationEvent::Success,
        ]
    );
    let env = h.env(&name).await;
    assert_eq!(env.status, EnvironmentStatus::Success);
    assert_eq!(env.source_sha, "sha2");
}

#[tokio::test]
async fn test_update_with_changed_config_rebuilds() {
    let h = Harness::new();
    let name = h.manager.create(&OpContext::new(), revision(3, "sha1")).await.unwrap();
    let old_namespace = h.cluster_env(&name).await.unwrap().namespace;
    h.metadata.set_config(repo_config("values/large.yaml"));

    h.manager.update(&OpContext::new(), revision(3, "sha2")).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(h.installer.calls_of("install:"), 2);
    assert_eq!(h.installer.calls_of("upgrade:"), 0);
    assert!(h
        .installer
        .calls()
        .contains(&format!("delete_namespace:{old_namespace}")));
    let cluster_env = h.cluster_env(&name).await.unwrap();
    assert_ne!(cluster_env.namespace, old_namespace);
    assert_eq!(
        cluster_env.config_signature,
        repo_config("values/large.yaml").config_signature().to_vec()
    );
    assert!(!h.data.get_helm_releases_for_env(&name).await.unwrap().is_empty());
    assert_eq!(h.metrics.count("env.update_tear_down"), 1);
}

#[tokio::test]
async fn test_update_after_failure_rebuilds_with_same_config() {
    let h = Harness::new();
    let name = h.manager.create(&OpContext::new(), revision(4, "sha1")).await.unwrap();
    let old_namespace = h.cluster_env(&name).await.unwrap().namespace;
    h.data
        .set_environment_status(&name, EnvironmentStatus::Failure)
        .await
        .unwrap();

    h.manager.update(&OpContext::new(), revision(4, "sha2")).await.unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(h.installer.calls_of("install:"), 2);
    assert_eq!(h.installer.calls_of("upgrade:"), 0);
    assert!(h
        .installer
        .calls()
        .contains(&format!("delete_namespace:{old_namespace}")));
    assert_eq!(h.env(&name).await.status, EnvironmentStatus::Success);
}

#[tokio::test]
async fn test_update_without_environment_creates_one() {
    let h = Harness::new();

    let name = h.manager.update(&OpContext::new(), revision(5, "sha1")).await.unwrap();

    assert_eq!(name, "env-1");
    assert_eq!(h.installer.calls(), vec!["install:env-1".to_string()]);
    assert_eq!(
        h.notifier.events(),
        vec![NotificationEvent::CreateEnvironment, NotificationEvent::Success]
    );
    assert_eq!(h.metrics.count("env.update_create"), 1);
}

#[tokio::test]
async fn test_update_failure_counts_update_error() {
    let h = Harness::new();
    h.manager.create(&OpContext::new(), revision(6, "sha1")).await.unwrap();
    h.metadata.set_config(repo_config("values/other.yaml"));
    h.installer.fail_install.store(true, Ordering::SeqCst);

    let err = h.manager.update(&OpContext::new(), revision(6, "sha2")).await.unwrap_err();

    assert!(err.to_string().starts_with("error installing charts"));
    assert_eq!(h.env("env-1").await.status, EnvironmentStatus::Failure);
    assert_eq!(h.metrics.count("env.update_errors"), 1);
    assert_eq!(h.notifier.events().last(), Some(&NotificationEvent::Failure));
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_destroys_environment_and_namespace() {
    let h = Harness::new();
    let name = h.manager.create(&OpContext::new(), revision(12, "sha1")).await.unwrap();
    let namespace = h.cluster_env(&name).await.unwrap().namespace;
    let ctx = OpContext::new();

    h.manager
        .delete(&ctx, revision(12, "sha1"), DestroyReason::PullRequestClosed)
        .await
        .unwrap();
    assert_eq!(h.env(&name).await.status, EnvironmentStatus::Destroyed);
    assert!(h.data.get_helm_releases_for_env(&name).await.unwrap().is_empty());

    h.manager.wait_for_background_tasks().await;
    assert!(h.installer.calls().contains(&format!("delete_namespace:{namespace}")));
    assert_eq!(h.installer.delete_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.notifier.events().last(),
        Some(&NotificationEvent::DestroyEnvironment)
    );
    let events = h.data.get_events(&name).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.message == "environment destroyed: pull request closed"));
    let op = h.data.get_operation(ctx.id()).await.unwrap().unwrap();
    assert_eq!(op.kind, OperationKind::Destroy);
    assert_eq!(op.status, OperationStatus::Done);
}

#[tokio::test]
async fn test_delete_without_extant_environment_marks_history_destroyed() {
    let h = Harness::new();
    h.seed_environment("gone-1", 13, EnvironmentStatus::Cancelled, hours(3))
        .await;
    h.seed_environment("gone-2", 13, EnvironmentStatus::Destroyed, hours(2))
        .await;

    h.manager
        .delete(&OpContext::new(), revision(13, "sha1"), DestroyReason::ReapAgeSpent)
        .await
        .unwrap();

    assert_eq!(h.env("gone-1").await.status, EnvironmentStatus::Destroyed);
    assert_eq!(
        h.data.status_history("gone-2"),
        vec![EnvironmentStatus::Destroyed]
    );
    assert!(h.installer.calls().is_empty());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_delete_of_unknown_pull_request_succeeds() {
    let h = Harness::new();

    h.manager
        .delete(&OpContext::new(), revision(14, "sha1"), DestroyReason::ApiRequest)
        .await
        .unwrap();

    assert!(h.data.get_environments_by_repo_and_pr(REPO, 14).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_namespace_deletion_retries_then_gives_up() {
    let h = Harness::new();
    h.installer.fail_delete_namespace.store(true, Ordering::SeqCst);
    let name = h.manager.create(&OpContext::new(), revision(15, "sha1")).await.unwrap();

    h.manager
        .delete(&OpContext::new(), revision(15, "sha1"), DestroyReason::PullRequestClosed)
        .await
        .unwrap();
    assert_eq!(h.env(&name).await.status, EnvironmentStatus::Destroyed);

    h.manager.wait_for_background_tasks().await;
    assert_eq!(h.installer.delete_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.metrics.timings("env.delete_namespace_duration"),
        vec![vec![
            format!("triggering_repo:{REPO}"),
            "success:false".to_string()
        ]]
    );
}

#[tokio::test]
async fn test_delete_without_cluster_environment_still_destroys() {
    let h = Harness::new();
    h.seed_environment("never-built", 16, EnvironmentStatus::Failure, hours(1))
        .await;

    h.manager
        .delete(&OpContext::new(), revision(16, "sha1"), DestroyReason::PullRequestClosed)
        .await
        .unwrap();
    h.manager.wait_for_background_tasks().await;

    assert_eq!(h.env("never-built").await.status, EnvironmentStatus::Destroyed);
    assert_eq!(h.installer.delete_attempts.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Data integrity
// =============================================================================

#[tokio::test]
async fn test_multiple_extant_environments_are_reported() {
    let h = Harness::new();
    h.seed_environment("twin-1", 17, EnvironmentStatus::Success, hours(2))
        .await;
    h.seed_environment("twin-2", 17, EnvironmentStatus::Success, hours(1))
        .await;

    let update = h.manager.update(&OpContext::new(), revision(17, "sha1")).await.unwrap_err();
    let delete = h
        .manager
        .delete(&OpContext::new(), revision(17, "sha1"), DestroyReason::ApiRequest)
        .await
        .unwrap_err();
    let create = h.manager.create(&OpContext::new(), revision(17, "sha1")).await.unwrap_err();

    for err in [update, delete, create] {
        assert!(
            matches!(err.root(), LifecycleError::ExtantEnvironments { found: 2 }),
            "unexpected error: {err}"
        );
        assert!(err.is_system_error());
    }
    assert_eq!(h.env("twin-1").await.status, EnvironmentStatus::Success);
    assert_eq!(h.env("twin-2").await.status, EnvironmentStatus::Success);
    assert!(h.installer.calls().is_empty());
}
