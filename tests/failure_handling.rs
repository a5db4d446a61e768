//! Failure isolation, retry, quota/disk policy, cancellation, and resume.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{Fault, TestEnv};
use vela_engine::{ErrorCategory, ItemStatus, RunResult, SpaceProbe};

#[tokio::test]
async fn temporary_failures_retry_and_succeed() {
    let env = TestEnv::new();
    env.write_local("flaky.txt", b"eventually fine");
    env.remote.inject_fault("upload:flaky.txt", Fault::Temporary);
    env.remote.inject_fault("upload:flaky.txt", Fault::Temporary);

    let summary = env.run().await;

    assert_eq!(summary.result, RunResult::Success);
    assert_eq!(env.remote.content_of("flaky.txt").unwrap(), b"eventually fine");
}

#[tokio::test]
async fn exhausted_retries_fail_the_item_not_the_run() {
    let env = TestEnv::new();
    env.write_local("doomed.txt", b"never arrives");
    env.write_local("fine.txt", b"arrives fine");
    env.remote
        .inject_sticky_fault("upload:doomed.txt", Fault::Temporary);

    let summary = env.run().await;

    assert_eq!(summary.result, RunResult::SuccessWithErrors);
    let doomed = summary
        .outcomes
        .iter()
        .find(|o| o.path.as_str() == "doomed.txt")
        .unwrap();
    assert!(matches!(
        doomed.status,
        ItemStatus::Failed {
            category: ErrorCategory::Transient,
            ..
        }
    ));
    // The sibling was unaffected.
    assert!(env.remote.exists("fine.txt"));
}

#[tokio::test]
async fn failed_item_resumes_next_run_without_retransfers() {
    let env = TestEnv::new();
    env.write_local("a.txt", b"committed early");
    env.write_local("b.txt", b"blocked this run");
    env.remote.inject_sticky_fault("upload:b.txt", Fault::Temporary);

    let first = env.run().await;
    assert_eq!(first.result, RunResult::SuccessWithErrors);
    assert_eq!(env.remote.upload_count("a.txt"), 1);
    assert!(!env.remote.exists("b.txt"));

    // The next run picks up where the journal left off: the committed item
    // is not re-uploaded, the failed one completes.
    env.remote.clear_faults();
    let second = env.run().await;
    assert_eq!(second.result, RunResult::Success);
    assert_eq!(env.remote.upload_count("a.txt"), 1);
    assert_eq!(env.remote.upload_count("b.txt"), 1);
}

#[tokio::test]
async fn quota_exceeded_upload_is_skipped_not_failed() {
    let env = TestEnv::new();
    env.write_local("big.txt", b"over quota");
    env.write_local("small.txt", b"ok");
    env.remote.inject_sticky_fault("upload:big.txt", Fault::Quota);

    let summary = env.run().await;

    let big = summary
        .outcomes
        .iter()
        .find(|o| o.path.as_str() == "big.txt")
        .unwrap();
    assert!(matches!(big.status, ItemStatus::Skipped { .. }));
    // Sibling jobs were not failed by the quota condition.
    assert!(env.remote.exists("small.txt"));
    assert!(!env.remote.exists("big.txt"));
}

struct AlmostFull;

impl SpaceProbe for AlmostFull {
    fn free_bytes(&self, _root: &Path) -> Option<u64> {
        Some(1024)
    }
}

#[tokio::test]
async fn low_disk_space_skips_downloads() {
    let env = TestEnv::new();
    env.remote.seed_file("incoming.bin", b"would not fit under the floor");

    let summary = env
        .run_with(|ctx| {
            ctx.space = Arc::new(AlmostFull);
            ctx.options.scheduler.disk_floor = 1024 * 1024;
        })
        .await;

    let outcome = summary
        .outcomes
        .iter()
        .find(|o| o.path.as_str() == "incoming.bin")
        .unwrap();
    assert!(matches!(outcome.status, ItemStatus::Skipped { .. }));
    assert!(!env.local_exists("incoming.bin"));

    // The journal must not claim the download happened.
    let journal = env.open_journal();
    assert!(journal
        .get_by_path(&vela_journal::RelPath::new("incoming.bin"))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn subtree_listing_failure_never_turns_into_deletions() {
    let env = TestEnv::new();
    env.remote.seed_file("docs/precious.txt", b"do not lose");
    env.run().await;
    assert!(env.local_exists("docs/precious.txt"));

    // The docs listing is broken this run; its absence from the replies
    // must not look like a remote delete.
    env.remote.inject_sticky_fault("list:docs", Fault::Protocol);

    let summary = env.run().await;
    assert_eq!(summary.result, RunResult::Success);
    assert!(env.local_exists("docs/precious.txt"));
    assert!(env.remote.exists("docs/precious.txt"));

    let journal = env.open_journal();
    assert!(journal
        .get_by_path(&vela_journal::RelPath::new("docs/precious.txt"))
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn listing_failures_abort_only_the_affected_subtree() {
    let env = TestEnv::new();
    env.remote.seed_file("broken/inside.txt", b"unreachable");
    env.remote.seed_file("healthy/fine.txt", b"reachable");
    env.remote.inject_sticky_fault("list:broken", Fault::Protocol);

    let summary = env.run().await;

    // The healthy sibling subtree synchronized normally.
    assert_eq!(summary.result, RunResult::Success);
    assert!(env.local_exists("healthy/fine.txt"));
    assert!(!env.local_exists("broken/inside.txt"));
}

#[tokio::test]
async fn unauthorized_aborts_the_run_without_item_errors() {
    let env = TestEnv::new();
    env.write_local("a.txt", b"never synced");
    env.remote.set_unauthorized(true);

    let summary = env.run().await;

    assert_eq!(summary.result, RunResult::Aborted);
    assert!(summary.outcomes.is_empty());
    assert!(!env.remote.exists("a.txt"));
}

#[tokio::test]
async fn cancelled_run_aborts_pending_jobs() {
    let env = TestEnv::new();
    env.write_local("a.txt", b"whatever");
    env.write_local("b.txt", b"whatever");

    let summary = env
        .run_with(|ctx| {
            // Cancel before propagation starts: every job must surface as
            // aborted, none may half-commit.
            ctx.cancel.cancel();
        })
        .await;

    assert_eq!(summary.result, RunResult::Aborted);
    assert!(summary
        .outcomes
        .iter()
        .all(|o| o.status == ItemStatus::Aborted));
    assert!(!env.remote.exists("a.txt"));
    assert!(!env.remote.exists("b.txt"));

    let journal = env.open_journal();
    assert!(journal.is_empty().unwrap());
}

#[tokio::test]
async fn read_only_remote_edit_is_restored_and_reported() {
    let env = TestEnv::new();
    env.write_local("policy.txt", b"managed v1");
    env.run().await;

    // The server revokes write access, then the user edits locally anyway.
    env.remote.set_permissions(
        "policy.txt",
        vela_journal::Permissions(vela_journal::Permissions::DELETE),
    );
    env.write_local("policy.txt", b"illegal local edit, longer");

    let summary = env.run().await;

    let outcome = summary
        .outcomes
        .iter()
        .find(|o| o.path.as_str() == "policy.txt")
        .unwrap();
    assert!(matches!(
        outcome.status,
        ItemStatus::Failed {
            category: ErrorCategory::Permission,
            ..
        }
    ));
    // The illegal edit was overwritten with the server version.
    assert_eq!(env.read_local("policy.txt"), b"managed v1");
    assert_eq!(env.remote.content_of("policy.txt").unwrap(), b"managed v1");
}

#[tokio::test]
async fn blacklisted_subtrees_are_left_alone() {
    let env = TestEnv::new();
    env.remote.seed_file("synced/wanted.txt", b"yes");
    env.remote.seed_file("excluded/unwanted.txt", b"no");

    let summary = env
        .run_with(|ctx| {
            ctx.selective = Arc::new(vela_engine::SubtreeBlacklist::new(vec![
                vela_journal::RelPath::new("excluded"),
            ]));
        })
        .await;

    assert_eq!(summary.result, RunResult::Success);
    assert!(env.local_exists("synced/wanted.txt"));
    assert!(!env.local_exists("excluded"));

    let excluded = summary
        .outcomes
        .iter()
        .find(|o| o.path.as_str() == "excluded")
        .unwrap();
    assert!(matches!(excluded.status, ItemStatus::Skipped { .. }));
}
