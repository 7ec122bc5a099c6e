//! Docker CLI backed collaborators.
//!
//! [`DockerBuilder`] downloads a gzipped source tarball, unpacks it into a
//! scratch directory and runs `docker build` on it. [`DockerRuntime`] runs
//! the resulting image with `docker run -it` on a PTY and cleans up with
//! `docker kill` / `docker rm`.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use futures_util::StreamExt;
use protocol::Stream;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::pty::PtyStream;
use super::{ContainerError, ContainerFuture, ContainerRuntime, ImageBuilder, ImageId};

/// File name of the downloaded archive inside the scratch directory.
const ARCHIVE_NAME: &str = "source.tgz";

/// Number of trailing stderr lines kept in build error messages.
const ERROR_TAIL_LINES: usize = 20;

/// Runs a docker (or compatible) CLI command and captures its output.
async fn run_cli(binary: &str, args: &[&str], dir: Option<&Path>) -> Result<Output, ContainerError> {
    let mut cmd = Command::new(binary);
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    tracing::debug!(binary = %binary, args = ?args, "Running container CLI");

    cmd.output()
        .await
        .map_err(|e| ContainerError::Runtime(format!("failed to run {binary}: {e}")))
}

/// Returns the last few lines of a command's stderr.
fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Returns true if a failed command only complained about something that is
/// already gone.
fn is_already_gone(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("No such container")
        || stderr.contains("No such image")
        || stderr.contains("is not running")
}

/// Builds images with `docker build` from downloaded source tarballs.
pub struct DockerBuilder {
    binary: String,
    work_dir: PathBuf,
    http: reqwest::Client,
}

impl DockerBuilder {
    /// Creates a builder that uses `binary` and keeps scratch files under `work_dir`.
    pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Scratch directory used while building `tag`.
    fn scratch_dir(&self, tag: &str) -> PathBuf {
        self.work_dir.join(tag.replace('/', "_"))
    }

    async fn download(&self, source: &str, target: &Path) -> Result<(), ContainerError> {
        let response = self
            .http
            .get(source)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ContainerError::BuildFailed(format!("download failed: {e}")))?;

        let mut file = tokio::fs::File::create(target).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| ContainerError::BuildFailed(format!("download failed: {e}")))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn unpack(&self, archive: &Path, repo: &Path) -> Result<(), ContainerError> {
        let archive = archive.to_string_lossy();
        let repo = repo.to_string_lossy();
        let output = run_cli(
            "tar",
            &["-C", &repo, "-xzf", &archive, "--strip-components=1"],
            None,
        )
        .await?;

        if !output.status.success() {
            return Err(ContainerError::BuildFailed(format!(
                "unpack failed: {}",
                stderr_tail(&output)
            )));
        }
        Ok(())
    }

    async fn build_in(&self, source: &str, tag: &str, scratch: &Path) -> Result<ImageId, ContainerError> {
        let repo = scratch.join("repo");
        tokio::fs::create_dir_all(&repo).await?;

        let archive = scratch.join(ARCHIVE_NAME);
        self.download(source, &archive).await?;
        self.unpack(&archive, &repo).await?;

        let output = run_cli(&self.binary, &["build", "-t", tag, "."], Some(&repo)).await?;
        if !output.status.success() {
            return Err(ContainerError::BuildFailed(format!(
                "image build failed: {}",
                stderr_tail(&output)
            )));
        }

        Ok(ImageId(tag.to_string()))
    }
}

impl ImageBuilder for DockerBuilder {
    fn build<'a>(
        &'a self,
        source: &'a str,
        tag: &'a str,
    ) -> ContainerFuture<'a, Result<ImageId, ContainerError>> {
        Box::pin(async move {
            let scratch = self.scratch_dir(tag);
            let result = self.build_in(source, tag, &scratch).await;

            // The build context is not needed once the image exists.
            if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove build directory");
                }
            }

            result.map_err(|e| match e {
                ContainerError::BuildFailed(_) => e,
                other => ContainerError::BuildFailed(other.to_string()),
            })
        })
    }

    fn remove_image<'a>(
        &'a self,
        image: &'a ImageId,
    ) -> ContainerFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            let output = run_cli(&self.binary, &["rmi", "-f", image.as_str()], None).await?;
            if output.status.success() || is_already_gone(&output) {
                Ok(())
            } else {
                Err(ContainerError::Runtime(stderr_tail(&output)))
            }
        })
    }
}

/// Runs containers with the docker CLI on a PTY.
pub struct DockerRuntime {
    binary: String,
    cols: u16,
    rows: u16,
}

impl DockerRuntime {
    /// Creates a runtime that spawns `binary` on terminals of `cols` x `rows`.
    pub fn new(binary: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            binary: binary.into(),
            cols,
            rows,
        }
    }

    /// Arguments for `docker run`.
    fn run_args(image: &ImageId, name: &str, command: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-it".to_string(),
            "--name".to_string(),
            name.to_string(),
            image.as_str().to_string(),
        ];
        args.extend(command.iter().cloned());
        args
    }

    async fn tolerant(&self, args: &[&str]) -> Result<(), ContainerError> {
        let output = run_cli(&self.binary, args, None).await?;
        if output.status.success() || is_already_gone(&output) {
            Ok(())
        } else {
            Err(ContainerError::Runtime(stderr_tail(&output)))
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn run<'a>(
        &'a self,
        image: &'a ImageId,
        name: &'a str,
        command: &'a [String],
    ) -> ContainerFuture<'a, Result<Arc<dyn Stream>, ContainerError>> {
        Box::pin(async move {
            let args = Self::run_args(image, name, command);
            let stream = PtyStream::spawn(name, &self.binary, &args, self.cols, self.rows)?;
            Ok(Arc::new(stream) as Arc<dyn Stream>)
        })
    }

    fn kill<'a>(&'a self, name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move { self.tolerant(&["kill", name]).await })
    }

    fn remove<'a>(&'a self, name: &'a str) -> ContainerFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move { self.tolerant(&["rm", "-f", "-v", name]).await })
    }
}
