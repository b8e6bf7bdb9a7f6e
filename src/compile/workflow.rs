//! Build workflow
//!
//! create source → upload → commit → materialize → install → build → persist(dist)
//! → start server → await readiness → summarize
//!
//! 每个阶段失败即中止，错误附带阶段名。取消只在阶段边界检查。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::gateway::{ArtifactGateway, GatewayError};
use super::mirror::{write_tree, MirrorMap};
use super::process_registry::{
    run_to_completion, spawn_tracked, ProcessInfo, RegistryError, SharedProcessRegistry,
};
use super::readiness::ReadinessWaiter;
use crate::config::WorkflowConfig;
use crate::sandbox::{join_path, Sandbox, SandboxError, SpawnOptions};

pub const SOURCE_DESCRIPTION: &str = "Source files for a sandbox build";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CreateSourceArtifact,
    UploadSourceFiles,
    CommitSource,
    Materialize,
    Install,
    Build,
    Persist,
    StartServer,
    AwaitReadiness,
    Summarize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CreateSourceArtifact => "create_source_artifact",
            Stage::UploadSourceFiles => "upload_source_files",
            Stage::CommitSource => "commit_source",
            Stage::Materialize => "materialize",
            Stage::Install => "install",
            Stage::Build => "build",
            Stage::Persist => "persist",
            Stage::StartServer => "start_server",
            Stage::AwaitReadiness => "await_readiness",
            Stage::Summarize => "summarize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("'{command}' exited with code {code}")]
    ExitCode { command: String, code: i32 },

    #[error("No command configured")]
    EmptyCommand,

    #[error("None of the fallback files exist in {0}")]
    NothingToPackage(String),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Build failed at stage {stage}: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: StepError,
    },

    #[error("Build cancelled before stage {0}")]
    Cancelled(Stage),
}

impl WorkflowError {
    pub fn stage(&self) -> Stage {
        match self {
            WorkflowError::StageFailed { stage, .. } => *stage,
            WorkflowError::Cancelled(stage) => *stage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Readiness {
    Ready { port: u16, url: String },
    /// Server started but no readiness notification arrived in time.
    Unconfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowSummary {
    pub run_id: String,
    pub source_artifact_id: String,
    pub build_artifact_id: String,
    pub files_uploaded: usize,
    pub files_loaded: usize,
    /// `None` when no install command is configured
    pub install_exit_code: Option<i32>,
    /// `None` when the build command could not be started
    pub build_exit_code: Option<i32>,
    pub build_fallback: bool,
    pub files_published: usize,
    pub server_process_id: String,
    pub readiness: Readiness,
    pub artifact_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BuildOutcome {
    exit_code: Option<i32>,
    fallback: bool,
}

fn split_command(argv: &[String]) -> Option<(&str, &[String])> {
    argv.split_first().map(|(cmd, rest)| (cmd.as_str(), rest))
}

pub struct Workflow<'a> {
    sandbox: &'a dyn Sandbox,
    gateway: &'a ArtifactGateway,
    processes: &'a SharedProcessRegistry,
    config: &'a WorkflowConfig,
    cancel: watch::Receiver<bool>,
}

impl<'a> Workflow<'a> {
    pub fn new(
        sandbox: &'a dyn Sandbox,
        gateway: &'a ArtifactGateway,
        processes: &'a SharedProcessRegistry,
        config: &'a WorkflowConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sandbox,
            gateway,
            processes,
            config,
            cancel,
        }
    }

    /// Run the whole sequence for `sources` (store-relative path → text).
    pub async fn run(&self, sources: MirrorMap) -> Result<WorkflowSummary, WorkflowError> {
        let stamp = Utc::now().timestamp_millis();
        let run_id = format!("run-{}", stamp);
        let source_alias = format!("{}-{}", self.config.source_prefix, stamp);
        let build_alias = format!("{}-{}", self.config.build_prefix, stamp);
        info!(run_id = %run_id, files = sources.len(), "Build workflow started");

        let source = self
            .step(Stage::CreateSourceArtifact, async {
                Ok(self
                    .gateway
                    .create_staged(&source_alias, SOURCE_DESCRIPTION)
                    .await?)
            })
            .await?;

        let files_uploaded = self
            .step(Stage::UploadSourceFiles, async {
                Ok(self.gateway.upload_files(&source.id, sources).await?)
            })
            .await?;

        self.step(Stage::CommitSource, async {
            Ok(self.gateway.commit(&source.id).await?)
        })
        .await?;

        let loaded = self
            .step(Stage::Materialize, async {
                Ok(self
                    .gateway
                    .materialize(self.sandbox, &source.id, &self.config.workdir)
                    .await?)
            })
            .await?;

        let install_exit_code = self.step(Stage::Install, self.install()).await?;
        let build = self.step(Stage::Build, self.build()).await?;

        let published = self
            .step(Stage::Persist, async {
                Ok(self
                    .gateway
                    .persist(self.sandbox, &self.config.dist_dir, &build_alias, "/")
                    .await?)
            })
            .await?;

        // 先订阅再启动进程
        let waiter = ReadinessWaiter::arm(self.sandbox);
        let server = self.step(Stage::StartServer, self.start_server()).await?;

        let timeout = Duration::from_millis(self.config.readiness_timeout_ms);
        let ready = self
            .step(Stage::AwaitReadiness, async { Ok(waiter.wait(timeout).await) })
            .await?;

        let summary = self
            .step(Stage::Summarize, async {
                let readiness = match ready {
                    Some(ready) => Readiness::Ready {
                        port: ready.port,
                        url: ready.url,
                    },
                    None => {
                        warn!("Server started but readiness unconfirmed");
                        Readiness::Unconfirmed
                    }
                };
                Ok(WorkflowSummary {
                    run_id: run_id.clone(),
                    source_artifact_id: source.id.clone(),
                    build_artifact_id: published.artifact_id.clone(),
                    files_uploaded,
                    files_loaded: loaded.files_loaded,
                    install_exit_code,
                    build_exit_code: build.exit_code,
                    build_fallback: build.fallback,
                    files_published: published.files_published,
                    server_process_id: server.process_id.clone(),
                    readiness,
                    artifact_url: self.gateway.artifact_url(&build_alias),
                })
            })
            .await?;

        info!(run_id = %run_id, "Build workflow completed");
        Ok(summary)
    }

    async fn step<T>(
        &self,
        stage: Stage,
        work: impl Future<Output = Result<T, StepError>>,
    ) -> Result<T, WorkflowError> {
        if *self.cancel.borrow() {
            warn!(stage = %stage, "Build cancelled");
            return Err(WorkflowError::Cancelled(stage));
        }
        info!(stage = %stage, "Stage started");
        match work.await {
            Ok(value) => {
                info!(stage = %stage, "Stage finished");
                Ok(value)
            }
            Err(source) => {
                error!(stage = %stage, "Stage failed: {}", source);
                Err(WorkflowError::StageFailed { stage, source })
            }
        }
    }

    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions::in_dir(self.config.workdir.clone())
    }

    async fn install(&self) -> Result<Option<i32>, StepError> {
        let Some((command, args)) = split_command(&self.config.install) else {
            info!("No install command configured, skipping");
            return Ok(None);
        };
        let outcome = run_to_completion(self.sandbox, command, args, &self.spawn_options()).await?;
        if outcome.exit_code != 0 {
            return Err(StepError::ExitCode {
                command: self.config.install.join(" "),
                code: outcome.exit_code,
            });
        }
        Ok(Some(outcome.exit_code))
    }

    async fn build(&self) -> Result<BuildOutcome, StepError> {
        let Some((command, args)) = split_command(&self.config.build) else {
            info!("No build command configured, packaging fallback files");
            return self.package_fallback(None).await;
        };
        match run_to_completion(self.sandbox, command, args, &self.spawn_options()).await {
            Ok(outcome) if outcome.exit_code == 0 => Ok(BuildOutcome {
                exit_code: Some(0),
                fallback: false,
            }),
            Ok(outcome) => {
                warn!(
                    exit_code = outcome.exit_code,
                    "Build command failed, packaging fallback files"
                );
                self.package_fallback(Some(outcome.exit_code)).await
            }
            Err(e) => {
                warn!("Build command could not start ({}), packaging fallback files", e);
                self.package_fallback(None).await
            }
        }
    }

    /// Copy the configured fallback files from the workdir into the dist dir.
    async fn package_fallback(&self, exit_code: Option<i32>) -> Result<BuildOutcome, StepError> {
        let mut files = MirrorMap::new();
        for name in &self.config.fallback_files {
            let path = join_path(&self.config.workdir, name);
            match self.sandbox.read_file(&path).await {
                Ok(content) => {
                    files.insert(name.clone(), content);
                }
                Err(SandboxError::NotFound(_)) => debug!(path = %path, "Fallback file missing"),
                Err(e) => return Err(e.into()),
            }
        }
        if files.is_empty() {
            return Err(StepError::NothingToPackage(self.config.workdir.clone()));
        }

        let copied = write_tree(self.sandbox, &files, &self.config.dist_dir).await?;
        info!(copied, dist_dir = %self.config.dist_dir, "Fallback files packaged");
        Ok(BuildOutcome {
            exit_code,
            fallback: true,
        })
    }

    async fn start_server(&self) -> Result<ProcessInfo, StepError> {
        let (command, args) = split_command(&self.config.start).ok_or(StepError::EmptyCommand)?;
        Ok(spawn_tracked(
            self.processes,
            self.sandbox,
            command,
            args,
            &self.spawn_options(),
        )
        .await?)
    }
}
