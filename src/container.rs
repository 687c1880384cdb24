//! Container control plane.
//!
//! [`ContainerClient`] is the seam between the session core and whatever
//! actually runs the container. [`DockerClient`] drives the `docker` CLI.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of a command run inside the container.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Flatten into the text returned to tool callers.
    pub fn render(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            out.push_str("\nstderr:\n");
            out.push_str(&self.stderr);
        }
        out.push_str(&format!("\nExit code: {}", self.exit_code));
        out
    }
}

/// Operations the session core needs from the container runtime.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Start the container if it is not running.
    async fn ensure_container(&self) -> Result<()>;

    /// Create a directory (and parents) inside the container. Idempotent.
    async fn ensure_workspace(&self, path: &Path) -> Result<()>;

    /// Recursively remove a path inside the container. Idempotent.
    async fn delete_path(&self, path: &Path) -> Result<()>;

    async fn write_marker(&self, path: &Path, body: &str) -> Result<()>;

    /// Read a marker back; `None` if it does not exist.
    async fn read_marker(&self, path: &Path) -> Result<Option<String>>;

    /// Run `command` with `workdir` as working directory, feeding `stdin` if given.
    async fn exec(&self, workdir: &Path, command: &[String], stdin: Option<&str>) -> Result<ExecOutput>;

    /// Create or overwrite a file, creating parent directories.
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    async fn copy_in(&self, host_path: &Path, container_path: &Path) -> Result<()>;

    async fn copy_out(&self, container_path: &Path, host_path: &Path) -> Result<()>;

    /// Destroy the container and start a fresh one from the base image.
    async fn recreate_container(&self) -> Result<String>;
}

/// Settings for [`DockerClient`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub container_name: String,
    pub image: String,
    pub workdir: String,
    pub timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_name: "mcp-code-interpreter".to_string(),
            image: "python:3.10-slim".to_string(),
            workdir: "/workspace".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// [`ContainerClient`] backed by the `docker` command line.
pub struct DockerClient {
    config: DockerConfig,
}

impl DockerClient {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, args: &[String], stdin: Option<&str>) -> Result<Output> {
        debug!("docker {:?}", args);
        let mut child = Command::new("docker")
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("spawn docker")?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await.context("write stdin")?;
            }
        }

        match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => bail!("docker {} failed: {e}", args.first().map(String::as_str).unwrap_or("")),
            Err(_) => bail!("docker command timed out after {}s", self.config.timeout.as_secs()),
        }
    }

    /// Like [`Self::docker`] but a non-zero exit status is an error.
    async fn docker_checked(&self, args: &[String], stdin: Option<&str>) -> Result<Output> {
        let output = self.docker(args, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output)
    }

    async fn listed(&self, all: bool) -> Result<bool> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        args.extend([
            "--filter".to_string(),
            format!("name={}", self.config.container_name),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ]);
        let output = self.docker_checked(&args, None).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|name| name == self.config.container_name))
    }

    async fn start(&self) -> Result<String> {
        let name = self.config.container_name.clone();
        if self.listed(true).await? {
            self.docker_checked(&["start".to_string(), name.clone()], None).await?;
            return Ok(format!("Starting existing container '{name}'."));
        }

        self.docker_checked(
            &[
                "run".to_string(),
                "-d".to_string(),
                "--name".to_string(),
                name.clone(),
                "-w".to_string(),
                self.config.workdir.clone(),
                self.config.image.clone(),
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ],
            None,
        )
        .await?;
        info!("Created container {} from {}", name, self.config.image);
        Ok(format!("Creating and starting container '{name}'."))
    }

    fn in_container(&self, shell: &str, arg: &Path) -> Vec<String> {
        vec![
            "exec".to_string(),
            "-i".to_string(),
            self.config.container_name.clone(),
            "sh".to_string(),
            "-c".to_string(),
            shell.to_string(),
            "sh".to_string(),
            arg.display().to_string(),
        ]
    }
}

#[async_trait]
impl ContainerClient for DockerClient {
    async fn ensure_container(&self) -> Result<()> {
        if !self.listed(false).await? {
            self.start().await?;
        }
        Ok(())
    }

    async fn ensure_workspace(&self, path: &Path) -> Result<()> {
        self.docker_checked(&self.in_container("mkdir -p \"$1\"", path), None).await?;
        Ok(())
    }

    async fn delete_path(&self, path: &Path) -> Result<()> {
        self.docker_checked(&self.in_container("rm -rf \"$1\"", path), None).await?;
        Ok(())
    }

    async fn write_marker(&self, path: &Path, body: &str) -> Result<()> {
        self.write_file(path, body).await
    }

    async fn read_marker(&self, path: &Path) -> Result<Option<String>> {
        let output = self
            .docker(&self.in_container("cat \"$1\" 2>/dev/null", path), None)
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let body = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!body.is_empty()).then_some(body))
    }

    async fn exec(&self, workdir: &Path, command: &[String], stdin: Option<&str>) -> Result<ExecOutput> {
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-w".to_string(),
            workdir.display().to_string(),
            self.config.container_name.clone(),
        ];
        args.extend(command.iter().cloned());

        let output = self.docker(&args, stdin).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        self.docker_checked(
            &self.in_container("mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"", path),
            Some(content),
        )
        .await?;
        Ok(())
    }

    async fn copy_in(&self, host_path: &Path, container_path: &Path) -> Result<()> {
        if let Some(parent) = container_path.parent() {
            self.ensure_workspace(parent).await?;
        }
        self.docker_checked(
            &[
                "cp".to_string(),
                host_path.display().to_string(),
                format!("{}:{}", self.config.container_name, container_path.display()),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn copy_out(&self, container_path: &Path, host_path: &Path) -> Result<()> {
        self.docker_checked(
            &[
                "cp".to_string(),
                format!("{}:{}", self.config.container_name, container_path.display()),
                host_path.display().to_string(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn recreate_container(&self) -> Result<String> {
        let name = self.config.container_name.clone();
        let mut messages = Vec::new();
        if self.listed(true).await? {
            messages.push(format!("Removing container '{name}'..."));
            self.docker_checked(&["rm".to_string(), "-f".to_string(), name], None).await?;
        }
        messages.push(self.start().await?);
        Ok(messages.join("\n"))
    }
}

/// In-memory container used by unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeState {
        pub dirs: BTreeSet<PathBuf>,
        pub files: BTreeMap<PathBuf, String>,
        pub execs: Vec<(PathBuf, Vec<String>, Option<String>)>,
        pub copied_in: Vec<(PathBuf, PathBuf)>,
        pub copied_out: Vec<(PathBuf, PathBuf)>,
        pub recreated: usize,
        pub fail_exec: bool,
        pub fail_marker_write: bool,
        pub delete_delay: Option<Duration>,
    }

    #[derive(Default)]
    pub struct FakeContainer {
        pub state: Mutex<FakeState>,
    }

    impl FakeContainer {
        pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
            self.state.lock().unwrap().dirs.contains(path.as_ref())
        }

        pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
            self.state.lock().unwrap().files.get(path.as_ref()).cloned()
        }

        pub fn set_fail_exec(&self, fail: bool) {
            self.state.lock().unwrap().fail_exec = fail;
        }
    }

    #[async_trait]
    impl ContainerClient for FakeContainer {
        async fn ensure_container(&self) -> Result<()> {
            Ok(())
        }

        async fn ensure_workspace(&self, path: &Path) -> Result<()> {
            self.state.lock().unwrap().dirs.insert(path.to_path_buf());
            Ok(())
        }

        async fn delete_path(&self, path: &Path) -> Result<()> {
            let delay = self.state.lock().unwrap().delete_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            state.dirs.retain(|dir| !dir.starts_with(path));
            state.files.retain(|file, _| !file.starts_with(path));
            Ok(())
        }

        async fn write_marker(&self, path: &Path, body: &str) -> Result<()> {
            let refuse = self.state.lock().unwrap().fail_marker_write;
            if refuse {
                bail!("marker write refused");
            }
            self.write_file(path, body).await
        }

        async fn read_marker(&self, path: &Path) -> Result<Option<String>> {
            Ok(self.file(path))
        }

        async fn exec(&self, workdir: &Path, command: &[String], stdin: Option<&str>) -> Result<ExecOutput> {
            let mut state = self.state.lock().unwrap();
            if state.fail_exec {
                bail!("exec refused");
            }
            state
                .execs
                .push((workdir.to_path_buf(), command.to_vec(), stdin.map(str::to_string)));
            Ok(ExecOutput {
                stdout: format!("ran in {}", workdir.display()),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .files
                .insert(path.to_path_buf(), content.to_string());
            Ok(())
        }

        async fn copy_in(&self, host_path: &Path, container_path: &Path) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .copied_in
                .push((host_path.to_path_buf(), container_path.to_path_buf()));
            Ok(())
        }

        async fn copy_out(&self, container_path: &Path, host_path: &Path) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .copied_out
                .push((container_path.to_path_buf(), host_path.to_path_buf()));
            Ok(())
        }

        async fn recreate_container(&self) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.dirs.clear();
            state.files.clear();
            state.recreated += 1;
            Ok("recreated".to_string())
        }
    }
}
