//! 部署清单存储
//!
//! 每次部署尝试一个文件：`<state_dir>/manifests/<project>/<env>/<manifest_id>.json`。
//! 每次状态迁移后都会持久化，进程中断后可以从最后一个清单继续。

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::write_json_atomic;
use crate::domain::deploy::{DeploymentManifest, InvalidTransition, ManifestStatus, ProjectEnvironment};
use crate::error::{DeployError, DeployResult};

/// 清单存储
#[derive(Clone, Debug)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn env_dir(&self, project_env: &ProjectEnvironment) -> PathBuf {
        self.root
            .join(&project_env.project)
            .join(project_env.environment.as_str())
    }

    fn path_for(&self, manifest: &DeploymentManifest) -> PathBuf {
        self.env_dir(&manifest.project_env())
            .join(format!("{}.json", manifest.manifest_id))
    }

    /// 保存清单；已是终态的清单只能按原样重写
    pub async fn save(&self, manifest: &DeploymentManifest) -> DeployResult<()> {
        let path = self.path_for(manifest);
        if let Some(existing) = read_manifest(&path).await {
            if existing.status.is_terminal()
                && serde_json::to_value(&existing)? != serde_json::to_value(manifest)?
            {
                warn!(
                    manifest_id = %manifest.manifest_id,
                    status = %existing.status,
                    "Refusing to rewrite terminal manifest"
                );
                return Err(InvalidTransition {
                    from: existing.status,
                    to: manifest.status,
                }
                .into());
            }
        }
        write_json_atomic(&path, manifest).await?;
        debug!(
            manifest_id = %manifest.manifest_id,
            status = %manifest.status,
            "Manifest saved"
        );
        Ok(())
    }

    pub async fn load(
        &self,
        project_env: &ProjectEnvironment,
        manifest_id: &str,
    ) -> DeployResult<DeploymentManifest> {
        let path = self.env_dir(project_env).join(format!("{}.json", manifest_id));
        read_manifest(&path)
            .await
            .ok_or_else(|| DeployError::NotFound(format!("manifest {}", manifest_id)))
    }

    /// 全部清单，按 ID（即时间）升序
    pub async fn list(&self, project_env: &ProjectEnvironment) -> DeployResult<Vec<DeploymentManifest>> {
        let dir = self.env_dir(project_env);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(manifest) = read_manifest(&path).await {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        Ok(manifests)
    }

    pub async fn latest(&self, project_env: &ProjectEnvironment) -> DeployResult<Option<DeploymentManifest>> {
        Ok(self.list(project_env).await?.pop())
    }

    /// 最新的指定状态清单
    pub async fn latest_with_status(
        &self,
        project_env: &ProjectEnvironment,
        status: ManifestStatus,
    ) -> DeployResult<Option<DeploymentManifest>> {
        Ok(self
            .list(project_env)
            .await?
            .into_iter()
            .rev()
            .find(|m| m.status == status))
    }

    /// 当前清单：最新的 healthy
    pub async fn current(&self, project_env: &ProjectEnvironment) -> DeployResult<Option<DeploymentManifest>> {
        self.latest_with_status(project_env, ManifestStatus::Healthy).await
    }
}

async fn read_manifest(path: &Path) -> Option<DeploymentManifest> {
    let content = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse manifest, ignoring");
            None
        }
    }
}
