//! Integration tests for the job and task commit protocol.
//!
//! Each test runs against its own named in-memory store wrapped in a
//! [`FaultyClient`], so store failures can be injected per operation.
//!
//! Run with: cargo test -p cirrus --test commit_protocol

mod common;

use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path;
use tempfile::TempDir;

use cirrus::layout::TaskAttemptDir;
use cirrus::{
    CommitCoordinator, CommitError, CommitterKind, ConflictMode, ErrorKind, JobContext,
    ObjectClient, ObjectClientRef, Pendingset, SuccessData, TaskAttemptContext,
};
use common::{FaultyClient, Op, test_config};

fn task(n: usize) -> TaskAttemptContext {
    TaskAttemptContext::new(format!("task_{n:02}"), format!("attempt_{n:02}_0"))
}

fn store_dir(coordinator: &CommitCoordinator, task: &TaskAttemptContext) -> Path {
    match coordinator.task_attempt_dir(task) {
        TaskAttemptDir::Store(dir) => dir,
        TaskAttemptDir::Local(dir) => panic!("expected a store directory, got {}", dir.display()),
    }
}

async fn magic_coordinator(client: &Arc<FaultyClient>, config: cirrus::CommitterConfig) -> CommitCoordinator {
    let destination: ObjectClientRef = client.clone();
    let coordinator =
        CommitCoordinator::new(destination, Path::from("out"), JobContext::new("job-1", 0), config);
    coordinator.setup_job().await.unwrap();
    coordinator
}

/// Test: files of 0, 50 and 250 bytes with a 100 byte part size, then a job
/// commit where one record cannot be completed.
///
/// Verifies that:
/// - Each record has ceil(len / part size) parts, at least one
/// - Task commit gathers all three into one pendingset
/// - The failing record is aborted, the others were completed, and the job fails
#[tokio::test]
async fn test_task_files_then_failing_job_commit() {
    let client = FaultyClient::memory("it-part-counts").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    let t1 = task(1);

    for (name, len) in [("a.bin", 0), ("b.bin", 50), ("c.bin", 250)] {
        coordinator
            .write_task_file(&t1, name, Bytes::from(vec![1u8; len]))
            .await
            .unwrap();
    }

    let ops = coordinator.operations();
    let (loaded, failures) = ops
        .load_pending(&store_dir(&coordinator, &t1), true, None)
        .await
        .unwrap();
    assert!(failures.is_empty());
    let parts: Vec<usize> = loaded.commits.iter().map(|c| c.part_count()).collect();
    assert_eq!(parts, vec![1, 1, 3]);

    coordinator.commit_task(&t1).await.unwrap();
    let pendingset = Pendingset::load(
        client.as_ref(),
        &coordinator.job_attempt_path().child("task_01.pendingset"),
    )
    .await
    .unwrap();
    assert_eq!(pendingset.len(), 3);
    assert!(pendingset.commits.iter().all(|c| c.task_id == "task_01"));
    assert!(pendingset.commits.iter().all(|c| c.job_id == "job-1"));

    client.fail_key(Op::Complete, "c.bin", ErrorKind::PermissionDenied, usize::MAX);
    let err = coordinator.commit_job().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let completed = client.calls(Op::Complete);
    assert_eq!(completed, vec!["out/a.bin", "out/b.bin", "out/c.bin"]);
    assert_eq!(client.calls(Op::Abort), vec!["out/c.bin"]);
    // The earlier completions were rolled back.
    assert_eq!(client.calls(Op::Delete), vec!["out/a.bin", "out/b.bin"]);
    assert!(client.head(&Path::from("out/_SUCCESS")).await.unwrap().is_none());
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
}

/// Test: task commit where the second of three records is unreadable.
///
/// Verifies that the readable records are aborted, the load error surfaces,
/// and no pendingset is written.
#[tokio::test]
async fn test_task_commit_with_corrupt_record() {
    let client = FaultyClient::memory("it-corrupt-record").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    let t1 = task(1);

    for name in ["1.csv", "2.csv", "3.csv"] {
        coordinator
            .write_task_file(&t1, name, Bytes::from_static(b"x,y\n"))
            .await
            .unwrap();
    }
    let corrupt = store_dir(&coordinator, &t1).child("2.csv.pending");
    client
        .put(&corrupt, Bytes::from_static(b"{\"bucket\": 3"))
        .await
        .unwrap();

    let err = coordinator.commit_task(&t1).await.unwrap_err();
    assert!(matches!(err, CommitError::Deserialize { .. }), "{err}");

    assert_eq!(client.calls(Op::Abort), vec!["out/1.csv", "out/3.csv"]);
    assert!(
        client
            .head(&coordinator.job_attempt_path().child("task_01.pendingset"))
            .await
            .unwrap()
            .is_none()
    );
    // Only the upload behind the unreadable record is left for the job abort.
    let open = client.list_uploads(&Path::from("out")).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].path, Path::from("out/2.csv"));

    // The unreadable record is reported, but its upload is still swept.
    let err = coordinator.abort_job().await.unwrap_err();
    assert!(matches!(err, CommitError::Deserialize { .. }), "{err}");
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
}

/// Test: replace mode deletes existing output only once precommit succeeds.
#[tokio::test]
async fn test_replace_mode() {
    let client = FaultyClient::memory("it-replace").await;
    client
        .put(&Path::from("out/old/part-0000"), Bytes::from_static(b"old"))
        .await
        .unwrap();
    let config = cirrus::CommitterConfig {
        conflict_mode: ConflictMode::Replace,
        ..test_config(100)
    };

    // A pendingset that cannot be read stops the job before anything is deleted.
    let coordinator = magic_coordinator(&client, config.clone()).await;
    client
        .put(
            &coordinator.job_attempt_path().child("task_09.pendingset"),
            Bytes::from_static(b"not json"),
        )
        .await
        .unwrap();
    assert!(coordinator.commit_job().await.is_err());
    assert!(client.head(&Path::from("out/old/part-0000")).await.unwrap().is_some());

    let coordinator = magic_coordinator(&client, config).await;
    let t1 = task(1);
    coordinator
        .write_task_file(&t1, "new/part-0000", Bytes::from_static(b"new"))
        .await
        .unwrap();
    coordinator.commit_task(&t1).await.unwrap();
    coordinator.commit_job().await.unwrap();

    // Old output is gone before the first record is finalized.
    let log = client.log();
    let first_complete = log
        .iter()
        .position(|(op, _)| *op == Op::Complete)
        .unwrap();
    let last_old_delete = log
        .iter()
        .rposition(|(op, path)| *op == Op::Delete && path.starts_with("out/old/"))
        .unwrap();
    assert!(last_old_delete < first_complete, "{log:?}");

    assert!(client.head(&Path::from("out/old/part-0000")).await.unwrap().is_none());
    assert_eq!(
        client.get(&Path::from("out/new/part-0000")).await.unwrap(),
        Bytes::from_static(b"new")
    );
    assert!(client.head(&Path::from("out/_SUCCESS")).await.unwrap().is_some());
}

/// Test: conflict mode `fail` rejects a destination that gained content
/// after setup.
#[tokio::test]
async fn test_fail_mode_checks_again_at_commit() {
    let client = FaultyClient::memory("it-fail-mode").await;
    let config = cirrus::CommitterConfig {
        conflict_mode: ConflictMode::Fail,
        ..test_config(100)
    };
    let coordinator = magic_coordinator(&client, config).await;
    let t1 = task(1);
    coordinator
        .write_task_file(&t1, "part-0000", Bytes::from_static(b"x"))
        .await
        .unwrap();
    coordinator.commit_task(&t1).await.unwrap();

    client
        .put(&Path::from("out/intruder"), Bytes::from_static(b"x"))
        .await
        .unwrap();
    let err = coordinator.commit_job().await.unwrap_err();
    assert!(matches!(err, CommitError::DestinationExists { .. }));
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
}

/// Test: staging layout, four tasks of three files, fifth completion fails.
///
/// Verifies that with a synchronous pool the four earlier completions are
/// reverted, the failing record plus the seven never started are aborted,
/// and no upload is left open.
#[tokio::test]
async fn test_staging_batch_failure_reverts_and_aborts() {
    let local = TempDir::new().unwrap();
    let client = FaultyClient::memory("it-staging-batch").await;
    let mut config = test_config(100);
    config.committer = CommitterKind::Staging;
    config.staging.local_dir = local.path().to_path_buf();
    config.staging.upload_uuid = Some("run1".to_string());

    let destination: ObjectClientRef = client.clone();
    let coordinator =
        CommitCoordinator::new(destination, Path::from("out"), JobContext::new("job-1", 0), config);
    coordinator.setup_job().await.unwrap();

    for n in 1..=4 {
        let t = task(n);
        coordinator.setup_task(&t).await.unwrap();
        for f in 1..=3 {
            coordinator
                .write_task_file(&t, &format!("t{n}-f{f}.csv"), Bytes::from(vec![0u8; 10 * f]))
                .await
                .unwrap();
        }
        coordinator.commit_task(&t).await.unwrap();
    }
    assert_eq!(client.count(Op::Initiate), 12);

    client.fail_key(Op::Complete, "t2-f2", ErrorKind::PermissionDenied, usize::MAX);
    let err = coordinator.commit_job().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    assert_eq!(client.count(Op::Complete), 5);
    assert_eq!(client.count(Op::Abort), 8);
    assert_eq!(
        client.calls(Op::Delete),
        vec![
            "out/t1-f1-run1.csv",
            "out/t1-f2-run1.csv",
            "out/t1-f3-run1.csv",
            "out/t2-f1-run1.csv",
        ]
    );

    let stats = coordinator.statistics().snapshot();
    assert_eq!(stats["commits_completed"], 4);
    assert_eq!(stats["commits_failed"], 1);
    assert_eq!(stats["commits_reverted"], 4);
    assert_eq!(stats["commits_aborted"], 8);
    assert_eq!(stats["jobs_failed"], 1);

    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
    assert!(client.list(&Path::from("out"), true).await.unwrap().is_empty());
    assert!(!local.path().join("run1").exists());
}

/// Test: throttled completions are retried with backoff until they succeed.
#[tokio::test]
async fn test_throttled_commit_is_retried() {
    let client = FaultyClient::memory("it-throttle").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    let t1 = task(1);
    coordinator
        .write_task_file(&t1, "part-0000", Bytes::from_static(b"data"))
        .await
        .unwrap();
    coordinator.commit_task(&t1).await.unwrap();

    client.fail(Op::Complete, ErrorKind::Throttled, 2);
    coordinator.commit_job().await.unwrap();

    assert_eq!(client.count(Op::Complete), 3);
    assert_eq!(
        client.get(&Path::from("out/part-0000")).await.unwrap(),
        Bytes::from_static(b"data")
    );
}

/// Test: an I/O failure starting an upload is not retried, and the task
/// commit fails.
#[tokio::test]
async fn test_initiate_is_not_retried_on_io_failure() {
    let local = TempDir::new().unwrap();
    let client = FaultyClient::memory("it-initiate-io").await;
    let mut config = test_config(100);
    config.committer = CommitterKind::Staging;
    config.staging.local_dir = local.path().to_path_buf();

    let destination: ObjectClientRef = client.clone();
    let coordinator =
        CommitCoordinator::new(destination, Path::from("out"), JobContext::new("job-1", 0), config);
    let t1 = task(1);
    coordinator.setup_task(&t1).await.unwrap();
    coordinator
        .write_task_file(&t1, "part-0000", Bytes::from_static(b"data"))
        .await
        .unwrap();

    client.fail(Op::Initiate, ErrorKind::Io, 1);
    let err = coordinator.commit_task(&t1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(client.count(Op::Initiate), 1);
    assert_eq!(coordinator.statistics().snapshot()["tasks_failed"], 1);
}

/// Test: uploads whose parts fail are aborted rather than left open.
#[tokio::test]
async fn test_failed_part_upload_is_aborted() {
    let local = TempDir::new().unwrap();
    let client = FaultyClient::memory("it-part-failure").await;
    let mut config = test_config(4);
    config.committer = CommitterKind::Staging;
    config.staging.local_dir = local.path().to_path_buf();

    let destination: ObjectClientRef = client.clone();
    let coordinator =
        CommitCoordinator::new(destination, Path::from("out"), JobContext::new("job-1", 0), config);
    let t1 = task(1);
    coordinator
        .write_task_file(&t1, "part-0000", Bytes::from(vec![9u8; 10]))
        .await
        .unwrap();

    client.fail_nth(Op::UploadPart, 2, ErrorKind::PermissionDenied);
    assert!(coordinator.commit_task(&t1).await.is_err());
    assert_eq!(client.count(Op::Abort), 1);
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());

    let stats = coordinator.statistics().snapshot();
    assert_eq!(stats["commits_created"], 0);
    assert_eq!(stats["commits_aborted"], 1);
}

/// Test: a record that vanishes between listing and loading is skipped by
/// task abort rather than reported.
#[tokio::test]
async fn test_abort_task_skips_vanished_record() {
    let client = FaultyClient::memory("it-vanished-record").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    let t1 = task(1);
    for name in ["a.csv", "b.csv"] {
        coordinator
            .write_task_file(&t1, name, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    client.fail_key(Op::Get, "a.csv.pending", ErrorKind::NotFound, 1);
    coordinator.abort_task(&t1).await.unwrap();

    assert_eq!(client.calls(Op::Abort), vec!["out/b.csv"]);
    assert!(!coordinator.needs_task_commit(&t1).await.unwrap());
}

/// Test: the success marker lists every committed file, however many.
#[tokio::test]
async fn test_success_marker_lists_every_file() {
    let client = FaultyClient::memory("it-many-files").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    let t1 = task(1);
    let files = 620;
    for n in 0..files {
        coordinator
            .write_task_file(&t1, &format!("part-{n:05}"), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    coordinator.commit_task(&t1).await.unwrap();
    coordinator.commit_job().await.unwrap();

    let marker = SuccessData::load(client.as_ref(), &Path::from("out/_SUCCESS"))
        .await
        .unwrap();
    assert_eq!(marker.filenames.len(), files);
    assert_eq!(marker.filenames[0], "out/part-00000");
    assert_eq!(marker.filenames[files - 1], "out/part-00619");
    assert_eq!(marker.metrics["commits_completed"], files as u64);
}

/// Test: aborting a job that never wrote anything succeeds.
#[tokio::test]
async fn test_abort_empty_job() {
    let client = FaultyClient::memory("it-abort-empty").await;
    let destination: ObjectClientRef = client.clone();
    let coordinator = CommitCoordinator::new(
        destination,
        Path::from("out"),
        JobContext::new("job-1", 0),
        test_config(100),
    );
    coordinator.abort_job().await.unwrap();
    assert_eq!(client.count(Op::Abort), 0);
}

/// Test: abort keeps going past failures and reports the first one.
#[tokio::test]
async fn test_abort_job_reports_first_failure() {
    let client = FaultyClient::memory("it-abort-failure").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    for n in 1..=2 {
        let t = task(n);
        coordinator
            .write_task_file(&t, &format!("f{n}"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        coordinator.commit_task(&t).await.unwrap();
    }

    client.fail_key(Op::Abort, "out/f1", ErrorKind::PermissionDenied, 1);
    let err = coordinator.abort_job().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // The second record was still aborted, and the orphan sweep caught the first.
    assert!(client.calls(Op::Abort).contains(&"out/f2".to_string()));
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
    assert!(client.list(&Path::from("out/__magic"), true).await.unwrap().is_empty());
}

/// Test: two tasks producing the same destination key fail the job, and
/// every upload is aborted.
#[tokio::test]
async fn test_duplicate_destination_fails_job() {
    let client = FaultyClient::memory("it-duplicate-destination").await;
    let coordinator = magic_coordinator(&client, test_config(100)).await;
    for n in 1..=2 {
        let t = task(n);
        coordinator
            .write_task_file(&t, "same.csv", Bytes::from_static(b"x"))
            .await
            .unwrap();
        coordinator.commit_task(&t).await.unwrap();
    }

    let err = coordinator.commit_job().await.unwrap_err();
    assert!(matches!(err, CommitError::DuplicateDestination { .. }), "{err}");
    assert_eq!(client.count(Op::Complete), 0);
    assert!(client.list_uploads(&Path::from("out")).await.unwrap().is_empty());
}
