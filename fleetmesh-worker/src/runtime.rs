//! The container runtime capability (spec §6 "Container runtime capability",
//! §9 "Callback-style container runtime ... adapt to a promise/future-
//! returning boundary"). Modeled as a trait so the supervisor never depends
//! on a concrete container engine; the reference implementation shells out
//! to the local `docker` (or `podman`) CLI.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// The outcome of running one container to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// `run(image: String, argv: Vec<String>, stdout_sink, options{auto_remove:
/// true, tty: false}) -> (exit_code, err?)` (spec §6), adapted to an async
/// `Result`-returning boundary per spec §9's design note.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, task_id: &str, image: &str, argv: &[String]) -> Result<ExitStatus>;
}

/// Shells out to the configured container CLI (`docker` by default, `podman`
/// also works unmodified since both accept the same `run --rm IMAGE ARGV...`
/// invocation). Auto-removes the container on exit; streams stdout/stderr
/// into this node's `tracing` log, matching spec §4.G step 3.
pub struct ProcessRuntime {
    binary: String,
}

impl ProcessRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn run(&self, task_id: &str, image: &str, argv: &[String]) -> Result<ExitStatus> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg("--rm")
            .arg(image)
            .args(argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {} for task {task_id}", self.binary))?;

        let stdout = child.stdout.take().context("child missing stdout pipe")?;
        let stderr = child.stderr.take().context("child missing stderr pipe")?;
        let task_id_out = task_id.to_string();
        let task_id_err = task_id.to_string();

        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(task_id = %task_id_out, "stdout: {line}");
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(task_id = %task_id_err, "stderr: {line}");
            }
        });

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting on container for task {task_id}"))?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        Ok(ExitStatus {
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Test double: returns a preconfigured exit code without touching the
/// process table, for `WorkerSupervisor` unit tests.
pub struct FakeRuntime {
    pub exit_code: i32,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, _task_id: &str, _image: &str, _argv: &[String]) -> Result<ExitStatus> {
        Ok(ExitStatus {
            code: self.exit_code,
        })
    }
}
