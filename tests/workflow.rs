//! End-to-end build workflow with `sh` standing in for the node toolchain.
#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use tokio::sync::watch;

use common::{service_context, sh_workflow, FakeStore};
use sandbox_compiler::compile::workflow::{Readiness, StepError};
use sandbox_compiler::compile::{Stage, Workflow, WorkflowError};
use sandbox_compiler::server::ServiceContext;

fn sources() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "index.js".to_string(),
            "console.log('App is live at http://localhost:3111')".to_string(),
        ),
        ("package.json".to_string(), "{\"name\":\"demo\"}".to_string()),
    ])
}

async fn run(
    ctx: &ServiceContext,
    sources: BTreeMap<String, String>,
    cancelled: bool,
) -> Result<sandbox_compiler::compile::WorkflowSummary, WorkflowError> {
    let (_cancel_tx, cancel_rx) = watch::channel(cancelled);
    let workflow = Workflow::new(
        ctx.sandbox.as_ref(),
        ctx.gateway.as_ref(),
        &ctx.processes,
        &ctx.config.workflow,
        cancel_rx,
    );
    workflow.run(sources).await
}

#[tokio::test]
async fn test_full_build_publishes_and_starts_server() {
    let store = FakeStore::start().await;
    let (_dir, ctx) = service_context(
        store.clone(),
        sh_workflow(
            "echo installing",
            "mkdir -p dist && cp index.js dist/index.js",
            "echo 'App is live at http://localhost:3111'; sleep 30",
        ),
    );

    let summary = run(&ctx, sources(), false).await.unwrap();

    assert_eq!(summary.files_uploaded, 2);
    assert_eq!(summary.files_loaded, 2);
    assert_eq!(summary.install_exit_code, Some(0));
    assert_eq!(summary.build_exit_code, Some(0));
    assert!(!summary.build_fallback);
    assert_eq!(summary.files_published, 1);
    assert!(summary.run_id.starts_with("run-"));
    match &summary.readiness {
        Readiness::Ready { port, .. } => assert_eq!(*port, 3111),
        other => panic!("Unexpected readiness: {:?}", other),
    }

    // 源制品与构建制品都已提交
    assert_eq!(store.commits(&summary.source_artifact_id), 1);
    assert_eq!(
        store.committed_files(&summary.source_artifact_id).len(),
        2
    );
    let published = store.committed_files(&summary.build_artifact_id);
    assert_eq!(published.keys().collect::<Vec<_>>(), vec!["index.js"]);

    let url = summary.artifact_url.clone().unwrap();
    assert!(url.starts_with("http://fake-store/artifacts/build-output-"));

    // 服务进程被登记，可以随后终止
    let mut processes = ctx.processes.lock().await;
    assert!(processes.contains(&summary.server_process_id));
    processes.kill(&summary.server_process_id).unwrap();
}

#[tokio::test]
async fn test_failed_build_packages_fallback_files() {
    let store = FakeStore::start().await;
    let mut workflow = sh_workflow("", "echo no build script; exit 1", "true");
    workflow.readiness_timeout_ms = 300;
    let (_dir, ctx) = service_context(store.clone(), workflow);

    let summary = run(&ctx, sources(), false).await.unwrap();

    assert_eq!(summary.install_exit_code, None);
    assert_eq!(summary.build_exit_code, Some(1));
    assert!(summary.build_fallback);
    assert_eq!(summary.files_published, 2);
    assert_eq!(summary.readiness, Readiness::Unconfirmed);
    assert_eq!(
        ctx.sandbox.read_file("/dist/package.json").await.unwrap(),
        "{\"name\":\"demo\"}"
    );
}

#[tokio::test]
async fn test_fallback_with_no_candidates_fails_build_stage() {
    let store = FakeStore::start().await;
    let (_dir, ctx) = service_context(store.clone(), sh_workflow("", "exit 1", "true"));

    let only_readme = BTreeMap::from([("README.md".to_string(), "# hi".to_string())]);
    let err = run(&ctx, only_readme, false).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Build);
    assert!(matches!(
        err,
        WorkflowError::StageFailed {
            source: StepError::NothingToPackage(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_install_failure_aborts_after_source_commit() {
    let store = FakeStore::start().await;
    let (_dir, ctx) = service_context(
        store.clone(),
        sh_workflow("exit 7", "mkdir -p dist", "true"),
    );

    let err = run(&ctx, sources(), false).await.unwrap_err();
    assert_eq!(err.stage(), Stage::Install);
    match err {
        WorkflowError::StageFailed {
            source: StepError::ExitCode { code, .. },
            ..
        } => assert_eq!(code, 7),
        other => panic!("Unexpected error: {:?}", other),
    }

    // 源文件已经上传并提交，不做回滚
    let aliases = store.aliases();
    assert_eq!(aliases.len(), 1);
    assert!(aliases[0].starts_with("build-source-"));
    assert_eq!(store.commits(&aliases[0]), 1);
    assert_eq!(
        ctx.sandbox.read_file("/index.js").await.unwrap(),
        sources()["index.js"]
    );
    assert!(ctx.processes.lock().await.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_first_stage() {
    let store = FakeStore::start().await;
    let (_dir, ctx) = service_context(store.clone(), sh_workflow("", "", "true"));

    let err = run(&ctx, sources(), true).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Cancelled(Stage::CreateSourceArtifact)
    ));
    assert!(ctx.processes.lock().await.is_empty());
}
