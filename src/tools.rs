//! The tool operations offered to callers, built on [`SessionCoordinator`].

use crate::config::WorkdirSources;
use crate::coordinator::SessionCoordinator;
use crate::error::{Error, Result};
use crate::paths;
use crate::state::SessionKind;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Host-side roots and container working directory used by [`Tools`].
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub workdir_in: WorkdirSources,
    pub workdir_out: WorkdirSources,
    pub container_workdir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub current: bool,
    pub age_secs: i64,
    pub idle_secs: i64,
}

pub struct Tools {
    coordinator: Arc<SessionCoordinator>,
    config: ToolsConfig,
}

impl Tools {
    pub fn new(coordinator: Arc<SessionCoordinator>, config: ToolsConfig) -> Self {
        Self { coordinator, config }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Make sure the container is up and start a new current session.
    pub async fn init(&self) -> Result<String> {
        Ok(self.coordinator.new_current().await?.id)
    }

    pub async fn new_current_session(&self) -> Result<String> {
        self.init().await
    }

    pub async fn run_code(&self, code: &str, session_id: Option<&str>) -> Result<String> {
        self.python(code, session_id, false).await
    }

    /// Run code in a throwaway session that is removed afterwards.
    pub async fn run_code_ephemeral(&self, code: &str) -> Result<String> {
        self.python(code, None, true).await
    }

    pub async fn run_file(&self, path: &str, session_id: Option<&str>) -> Result<String> {
        let client = self.coordinator.client().clone();
        self.coordinator
            .run_scoped(session_id, false, |session| async move {
                let script = self.coordinator.scope_path(&session, path)?;
                let command = vec!["python".to_string(), script.display().to_string()];
                let output = client.exec(&session.workspace_path, &command, None).await?;
                Ok::<_, Error>(output.render())
            })
            .await
    }

    /// Copy a host file into the session workspace. `container_path`
    /// defaults to the file's basename.
    pub async fn cp_in(
        &self,
        local_path: &str,
        container_path: Option<&str>,
        session_id: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<String> {
        let source = paths::host_path(&self.config.workdir_in.root(workdir), local_path)?;
        let target = match container_path.filter(|p| !p.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => basename(local_path)?,
        };

        let client = self.coordinator.client().clone();
        self.coordinator
            .run_scoped(session_id, false, |session| async move {
                let dest = self.coordinator.scope_path(&session, &target)?;
                client.copy_in(&source, &dest).await?;
                Ok::<_, Error>(format!("Copied host:{} to container:{}", source.display(), dest.display()))
            })
            .await
    }

    /// Copy a file out of the session workspace to the host. `local_path`
    /// defaults to the file's basename under the output root.
    pub async fn cp_out(
        &self,
        container_path: &str,
        local_path: Option<&str>,
        session_id: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<String> {
        let local = match local_path.filter(|p| !p.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => basename(container_path)?,
        };
        let dest = paths::host_path(&self.config.workdir_out.root(workdir), &local)?;

        let client = self.coordinator.client().clone();
        self.coordinator
            .run_scoped(session_id, false, |session| async move {
                let source = self.coordinator.scope_path(&session, container_path)?;
                client.copy_out(&source, &dest).await?;
                Ok::<_, Error>(format!("Copied container:{} to host:{}", source.display(), dest.display()))
            })
            .await
    }

    /// Create or overwrite a file in the session workspace.
    pub async fn edit_file(&self, container_path: &str, content: &str, session_id: Option<&str>) -> Result<String> {
        let client = self.coordinator.client().clone();
        self.coordinator
            .run_scoped(session_id, false, |session| async move {
                let target = self.coordinator.scope_path(&session, container_path)?;
                client.write_file(&target, content).await?;
                Ok::<_, Error>(format!("Wrote {} bytes to container:{}", content.len(), target.display()))
            })
            .await
    }

    pub async fn list_packages(&self) -> Result<String> {
        let client = self.coordinator.client();
        client.ensure_container().await?;
        let command = ["pip", "list"].map(String::from);
        let output = client.exec(&self.config.container_workdir, &command, None).await?;
        Ok(output.render())
    }

    /// Remove every session and recreate the container.
    pub async fn reset(&self) -> Result<String> {
        self.coordinator.reset().await
    }

    pub async fn close_session(&self, session_id: &str) -> String {
        if session_id.is_empty() {
            return "session_id is required".to_string();
        }
        self.coordinator.close(session_id).await;
        format!("closed {session_id}")
    }

    /// The current session id, or an empty string if there is none.
    pub async fn get_current_session(&self) -> String {
        self.coordinator.current_id().await.unwrap_or_default()
    }

    pub async fn close_current_session(&self) -> String {
        match self.coordinator.close_current().await {
            Some(id) => format!("closed {id}"),
            None => "no current session".to_string(),
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let current = self.coordinator.current_id().await;
        let store = self.coordinator.store();
        let now = store.now();
        store
            .list()
            .await
            .into_iter()
            .map(|s| SessionInfo {
                current: current.as_deref() == Some(s.id.as_str()),
                age_secs: now.signed_duration_since(s.created_at).num_seconds(),
                idle_secs: now.signed_duration_since(s.last_used_at).num_seconds(),
                id: s.id,
                kind: s.kind,
            })
            .collect()
    }

    async fn python(&self, code: &str, session_id: Option<&str>, ephemeral: bool) -> Result<String> {
        let client = self.coordinator.client().clone();
        let result = self
            .coordinator
            .run_scoped(session_id, ephemeral, |session| async move {
                let command = ["python", "-"].map(String::from);
                let output = client.exec(&session.workspace_path, &command, Some(code)).await?;
                Ok::<_, Error>(output.render())
            })
            .await;
        if ephemeral {
            info!("Ephemeral run finished: ok={}", result.is_ok());
        }
        result
    }
}

fn basename(path: &str) -> Result<PathBuf> {
    Path::new(path)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| Error::invalid_path(path, "path has no file name"))
}
