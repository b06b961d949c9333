//! 部署上下文
//!
//! 一次部署尝试的执行上下文：持有清单，把每个阶段写入清单的阶段轨迹并持久化

use tracing::{info, warn};

use crate::config::project::ProjectEnvConfig;
pub use crate::domain::deploy::{
    STAGE_APPROVAL, STAGE_BACKUP, STAGE_HEALTH, STAGE_ROLLBACK, STAGE_STAGING, STAGE_SWITCH,
};
use crate::domain::deploy::{DeployStage, DeploymentManifest, StageStatus};
use crate::error::DeployResult;
use crate::state::AppState;

const STAGES: [(&str, &str); 6] = [
    (STAGE_STAGING, "Staging"),
    (STAGE_APPROVAL, "Approval"),
    (STAGE_BACKUP, "Backup"),
    (STAGE_SWITCH, "Production Switch"),
    (STAGE_HEALTH, "Health Check"),
    (STAGE_ROLLBACK, "Rollback"),
];

/// 部署执行上下文
pub struct DeployContext<'a> {
    pub state: &'a AppState,
    pub env: ProjectEnvConfig,
    pub manifest: DeploymentManifest,
}

impl<'a> DeployContext<'a> {
    pub fn new(state: &'a AppState, env: ProjectEnvConfig, mut manifest: DeploymentManifest) -> Self {
        if manifest.stages.is_empty() {
            manifest.stages = STAGES
                .iter()
                .map(|(name, display)| DeployStage::new(name, display))
                .collect();
        }
        Self { state, env, manifest }
    }

    fn stage_mut(&mut self, name: &str) -> Option<&mut DeployStage> {
        self.manifest.stages.iter_mut().find(|s| s.name == name)
    }

    /// 持久化清单
    pub async fn save(&self) -> DeployResult<()> {
        self.state.manifests.save(&self.manifest).await
    }

    pub async fn start_stage(&mut self, name: &str) -> DeployResult<()> {
        if let Some(stage) = self.stage_mut(name) {
            stage.start();
        }
        info!(
            manifest_id = %self.manifest.manifest_id,
            project_env = %self.env.project_env,
            stage = name,
            "Stage started"
        );
        self.save().await
    }

    pub async fn finish_stage(&mut self, name: &str, success: bool, message: Option<String>) -> DeployResult<()> {
        self.manifest.finish_stage(name, success, message.clone());
        if success {
            info!(manifest_id = %self.manifest.manifest_id, stage = name, "Stage finished");
        } else {
            warn!(
                manifest_id = %self.manifest.manifest_id,
                stage = name,
                message = message.as_deref().unwrap_or(""),
                "Stage failed"
            );
        }
        self.save().await
    }

    pub async fn skip_stage(&mut self, name: &str, reason: &str) -> DeployResult<()> {
        if let Some(stage) = self.stage_mut(name) {
            stage.skip(Some(reason.to_string()));
        }
        self.save().await
    }

    /// 标记失败；已是终态（例如切换失败时执行器已经标记）则保持不变
    pub async fn fail(&mut self, kind: &str, message: impl Into<String>, manual: bool) -> DeployResult<()> {
        if self.manifest.status.is_terminal() {
            return Ok(());
        }
        self.manifest.fail(kind, message, manual)?;
        self.save().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// 输出阶段汇总
    pub fn log_summary(&self) {
        for stage in &self.manifest.stages {
            if stage.status == StageStatus::Pending {
                continue;
            }
            info!(
                manifest_id = %self.manifest.manifest_id,
                stage = %stage.name,
                status = ?stage.status,
                duration_ms = stage.duration_ms.unwrap_or(0),
                message = stage.message.as_deref().unwrap_or(""),
                "Stage summary"
            );
        }
        info!(
            manifest_id = %self.manifest.manifest_id,
            project_env = %self.env.project_env,
            status = %self.manifest.status,
            "Deployment finished"
        );
    }
}
