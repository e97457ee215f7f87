
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use grid_control::access::AccessToken;
use grid_control::backend::context::BackendContext;
use grid_control::backend::host::HostBackend;
use grid_control::backend::process::ProcessRunner;
use grid_control::backend::sandbox::{read_job_info, STDOUT_NAME};
use grid_control::backend::{BackendHandle, GlobalId, SharedBackend, StatusReport, SubmitRequest};
use grid_control::error::GridError;
use grid_control::scheduler::{JobDb, JobManager, JobState};
use grid_control::task::{Requirements, StaticTask, Task};
use test_harness::{limits, wait_for, HostJobGuard};

/// Create a host backend writing its sandboxes below `workdir`
fn test_backend(workdir: &Path) -> Arc<HostBackend> {
    let ctx = BackendContext::new(
        workdir,
        ProcessRunner::new(Duration::from_secs(10)),
        Arc::new(AccessToken::trivial()),
    );
    Arc::new(HostBackend::new("HOST", ctx))
}

fn shell_task(jobs: u32, script: &str) -> Arc<dyn Task> {
    Arc::new(
        StaticTask::new(jobs, "sh").with_arguments(vec!["-c".to_string(), script.to_string()]),
    )
}

async fn submit_all(backend: &HostBackend, task: Arc<dyn Task>) -> Vec<GlobalId> {
    let requests: Vec<SubmitRequest> = (0..task.job_count())
        .map(|job| SubmitRequest::new(job, Requirements::default()))
        .collect();
    backend
        .submit(requests, task)
        .map(|r| r.unwrap().1.expect("submission should succeed"))
        .collect()
        .await
}

async fn check(backend: &HostBackend, ids: &[GlobalId]) -> Vec<StatusReport> {
    backend
        .check(ids.to_vec())
        .map(|r| r.unwrap())
        .collect()
        .await
}

async fn wait_for_state(backend: &HostBackend, id: &GlobalId, state: JobState) -> bool {
    wait_for(
        || async move {
            check(backend, std::slice::from_ref(id))
                .await
                .iter()
                .any(|r| r.state == state)
        },
        Duration::from_secs(10),
        Duration::from_millis(50),
    )
    .await
}

#[tokio::test]
async fn test_submit_runs_job_to_done() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let task = shell_task(1, "echo hello");
    backend.deploy(task.as_ref()).await.unwrap();

    let ids = submit_all(&backend, task).await;
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].backend(), "HOST");
    assert!(wait_for_state(&backend, &ids[0], JobState::Done).await);

    let retrieved: Vec<_> = backend
        .retrieve(ids.clone())
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(retrieved.len(), 1);
    let dir = retrieved[0].1.clone().expect("sandbox should exist");
    let info = read_job_info(&dir).await.unwrap();
    assert_eq!(info.exit_code, Some(0));
    let stdout = std::fs::read_to_string(dir.join(STDOUT_NAME)).unwrap();
    assert_eq!(stdout, "hello\n");
}

#[tokio::test]
async fn test_exit_code_is_recorded() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let task = shell_task(1, "exit 3");
    backend.deploy(task.as_ref()).await.unwrap();

    let ids = submit_all(&backend, task).await;
    assert!(wait_for_state(&backend, &ids[0], JobState::Done).await);

    let (_, dir) = backend
        .retrieve(ids)
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await
        .remove(0);
    let info = read_job_info(&dir.unwrap()).await.unwrap();
    assert_eq!(info.exit_code, Some(3));
}

#[tokio::test]
async fn test_running_job_is_reported_and_cancelled() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let task = shell_task(2, "sleep 30");
    backend.deploy(task.as_ref()).await.unwrap();

    let ids = submit_all(&backend, task).await;
    let _cleanup = HostJobGuard::new(&ids);
    let reports = check(&backend, &ids).await;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.state == JobState::Running));
    assert!(reports.iter().all(|r| r.attributes["dest"] == "localhost"));

    let cancelled: Vec<GlobalId> = backend
        .cancel(vec![ids[0].clone()])
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(cancelled, vec![ids[0].clone()]);

    let gone = wait_for(
        || {
            let backend = backend.clone();
            let first = ids[0].clone();
            async move { check(&backend, &[first]).await.is_empty() }
        },
        Duration::from_secs(10),
        Duration::from_millis(50),
    )
    .await;
    assert!(gone, "cancelled job should disappear from ps");
    assert_eq!(check(&backend, &ids[1..]).await.len(), 1);

    let cancelled = backend.cancel(vec![ids[1].clone()]).count().await;
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn test_submit_before_deploy_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let task = shell_task(1, "true");

    let results: Vec<_> = backend
        .submit(vec![SubmitRequest::new(0, Requirements::default())], task)
        .collect()
        .await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(GridError::NotDeployed(ref name)) if name == "HOST"));
}

#[tokio::test]
async fn test_empty_input_yields_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let task = shell_task(1, "true");

    // Not deployed: any contact with the host would yield an error.
    assert_eq!(backend.submit(Vec::new(), task).count().await, 0);
    assert_eq!(backend.check(Vec::new()).count().await, 0);
    assert_eq!(backend.retrieve(Vec::new()).count().await, 0);
    assert_eq!(backend.cancel(Vec::new()).count().await, 0);
}

#[tokio::test]
async fn test_unknown_ids_are_omitted() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = test_backend(tmp.path());
    let ids = vec![
        GlobalId::new("HOST", "999999999.0-missing"),
        GlobalId::new("HOST", "notapid.0-x"),
    ];

    assert!(check(&backend, &ids).await.is_empty());

    let retrieved: Vec<_> = backend
        .retrieve(ids.clone())
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert!(retrieved.iter().all(|(_, dir)| dir.is_none()));

    let cancelled: Vec<_> = backend.cancel(ids).collect().await;
    assert!(cancelled.is_empty());
}

#[tokio::test]
async fn test_manager_drives_host_jobs_to_success() {
    let tmp = tempfile::tempdir().unwrap();
    let backend: SharedBackend = test_backend(tmp.path());
    let task = shell_task(3, "echo job $GC_JOB_ID");
    let db = JobDb::open(tmp.path(), 3).unwrap();
    let mut manager = JobManager::new(db, backend, task, limits(3, 5));

    let mut finished = false;
    for _ in 0..100 {
        manager.cycle().await.unwrap();
        if manager.is_finished() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(finished, "jobs should finish on the local host");

    for (_, job) in manager.db().iter() {
        assert_eq!(job.state(), JobState::Success);
        assert_eq!(job.attempt(), 1);
        assert_eq!(job.destination(), Some("localhost"));
    }
}

#[tokio::test]
async fn test_workdir_with_quote_runs_job() {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = tmp.path().join("it's here");
    let backend = test_backend(&workdir);
    let task = shell_task(1, "echo quoted");
    backend.deploy(task.as_ref()).await.unwrap();

    let ids = submit_all(&backend, task).await;
    assert_eq!(ids.len(), 1);
    assert!(wait_for_state(&backend, &ids[0], JobState::Done).await);

    let (_, dir) = backend
        .retrieve(ids)
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await
        .remove(0);
    let stdout = std::fs::read_to_string(dir.unwrap().join(STDOUT_NAME)).unwrap();
    assert_eq!(stdout, "quoted\n");
}
