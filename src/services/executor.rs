//! 生产切换
//!
//! 写入候选配置（逐个文件原子替换）→ 可选替换应用镜像 → 通知代理 reload。
//! reload 成功后清单才进入 promoted；任一步失败都会把磁盘上的文件恢复原样，
//! 清单标记为 failed，不做数据回滚。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::env::constants::PROXY_LOCK_KEY;
use crate::config::project::ProjectEnvConfig;
use crate::domain::backup::Backup;
use crate::domain::deploy::{DeploymentManifest, ManifestStatus, STAGE_SWITCH};
use crate::domain::proxy_config::CandidateConfig;
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

/// 线上配置写入器，记录写入前的内容以便恢复
pub struct LiveConfigWriter {
    dir: PathBuf,
    /// (文件名, 写入前内容；None 表示原本不存在)
    previous: Vec<(String, Option<String>)>,
    removed: Vec<String>,
}

impl LiveConfigWriter {
    /// 写入 `files` 并删除 `remove` 中的文件；中途失败时恢复已写入的部分
    pub async fn apply(
        dir: &Path,
        files: &BTreeMap<String, String>,
        remove: &[String],
    ) -> std::io::Result<Self> {
        let mut writer = Self {
            dir: dir.to_path_buf(),
            previous: Vec::new(),
            removed: Vec::new(),
        };
        if let Err(e) = writer.apply_inner(files, remove).await {
            if let Err(revert_err) = writer.revert_inner().await {
                error!(error = %revert_err, "Failed to revert partially written config");
            }
            return Err(e);
        }
        Ok(writer)
    }

    async fn apply_inner(&mut self, files: &BTreeMap<String, String>, remove: &[String]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        for (name, content) in files {
            let path = self.dir.join(name);
            let previous = read_optional(&path).await?;
            write_atomic(&path, content).await?;
            self.previous.push((name.clone(), previous));
        }
        for name in remove {
            let path = self.dir.join(name);
            if let Some(previous) = read_optional(&path).await? {
                fs::remove_file(&path).await?;
                self.previous.push((name.clone(), Some(previous)));
                self.removed.push(name.clone());
            }
        }
        Ok(())
    }

    async fn revert_inner(&mut self) -> std::io::Result<()> {
        for (name, previous) in self.previous.drain(..).rev() {
            let path = self.dir.join(&name);
            match previous {
                Some(content) => write_atomic(&path, &content).await?,
                None => match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// 恢复写入前的状态
    pub async fn revert(mut self) -> std::io::Result<()> {
        self.revert_inner().await
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.clone()
    }
}

async fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// 同目录临时文件 + rename
async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.rollout-tmp", file_name));
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await
}

/// 执行生产切换
///
/// 调用方持有 (项目, 环境) 锁；这里额外获取平台级代理锁
pub async fn execute(
    state: &AppState,
    env: &ProjectEnvConfig,
    manifest: &mut DeploymentManifest,
    candidate: &CandidateConfig,
    backup: &Backup,
) -> DeployResult<()> {
    if manifest.status != ManifestStatus::Staged {
        return Err(DeployError::InvalidTransition(
            crate::domain::deploy::InvalidTransition {
                from: manifest.status,
                to: ManifestStatus::Promoted,
            },
        ));
    }
    // 备份必须已完整写入
    let stored = state.backups.get(&env.project_env, &backup.id).await?;
    if stored.project_env() != env.project_env {
        return Err(DeployError::CrossEnvironmentRestore {
            backup: backup.id.clone(),
            source_env: stored.project_env().to_string(),
            target: env.project_env.to_string(),
        });
    }
    manifest.backup_id = Some(stored.id.clone());
    manifest.previous_image = stored.config.image.clone();
    state.manifests.save(manifest).await?;

    let _proxy_lock = state.locks.acquire(PROXY_LOCK_KEY, &format!("execute {}", env.project_env))?;

    match switch(state, env, candidate, backup).await {
        Ok(()) => {
            manifest.transition(ManifestStatus::Promoted)?;
            state.manifests.save(manifest).await?;
            info!(
                manifest_id = %manifest.manifest_id,
                project_env = %env.project_env,
                "Production switched, manifest promoted"
            );
            Ok(())
        }
        Err(message) => {
            error!(manifest_id = %manifest.manifest_id, error = %message, "Production switch failed");
            manifest.finish_stage(STAGE_SWITCH, false, Some(message.clone()));
            manifest.fail("switch_failed", message.clone(), false)?;
            state.manifests.save(manifest).await?;
            Err(DeployError::SwitchFailed(message))
        }
    }
}

/// 切换本身，失败时已经恢复磁盘文件
async fn switch(
    state: &AppState,
    env: &ProjectEnvConfig,
    candidate: &CandidateConfig,
    backup: &Backup,
) -> Result<(), String> {
    let writer = LiveConfigWriter::apply(&state.config.live_conf_dir, &candidate.files, &[])
        .await
        .map_err(|e| format!("failed to write config: {}", e))?;

    let revert = |writer: LiveConfigWriter, reason: String| async move {
        if let Err(e) = writer.revert().await {
            error!(error = %e, "Failed to restore previous config files");
            return format!("{}; restoring previous files also failed: {}", reason, e);
        }
        warn!("Previous config files restored");
        reason
    };

    let mut image_replaced = false;
    if let (Some(image), Some(container)) = (&candidate.image, &env.app_container) {
        if let Err(e) = state.runtime.replace_image(container, image).await {
            return Err(revert(writer, format!("image replacement failed: {}", e.diagnostic())).await);
        }
        image_replaced = true;
    }

    if let Err(e) = state.runtime.signal_reload(&state.config.proxy.container).await {
        let mut reason = format!("proxy reload failed: {}", e.diagnostic());
        if image_replaced {
            if let (Some(previous), Some(container)) = (&backup.config.image, &env.app_container) {
                if let Err(e) = state.runtime.replace_image(container, previous).await {
                    reason.push_str(&format!("; reinstating image {} failed: {}", previous, e));
                }
            }
        }
        return Err(revert(writer, reason).await);
    }
    Ok(())
}
