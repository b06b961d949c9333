//! 回滚
//!
//! 从清单引用的备份恢复部署前的配置和镜像，reload 代理，再恢复数据库。
//! 恢复数据库期间应用容器停止，结束后无论成败都重新启动。
//! 回滚失败时清单标记为 failed 并要求人工介入，不自动重试。

use serde::Serialize;
use std::future::Future;
use tracing::{error, info};

use crate::config::env::constants::PROXY_LOCK_KEY;
use crate::config::project::ProjectEnvConfig;
use crate::domain::deploy::{DeploymentManifest, InvalidTransition, ManifestStatus, STAGE_ROLLBACK};
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

use super::backup::{self, RestoreReport};

#[derive(Clone, Debug, Serialize)]
pub struct RollbackReport {
    pub manifest_id: String,
    pub backup_id: String,
    pub restore: RestoreReport,
}

/// 回滚一个 promoted 清单
///
/// 调用方持有 (项目, 环境) 锁。代理锁被占用时返回 `Busy`，此时清单和线上都未改动。
pub async fn rollback(
    state: &AppState,
    env: &ProjectEnvConfig,
    manifest: &mut DeploymentManifest,
) -> DeployResult<RollbackReport> {
    if manifest.status != ManifestStatus::Promoted {
        return Err(InvalidTransition {
            from: manifest.status,
            to: ManifestStatus::RolledBack,
        }
        .into());
    }
    let _proxy_lock = state
        .locks
        .acquire(PROXY_LOCK_KEY, &format!("rollback {}", env.project_env))?;

    info!(manifest_id = %manifest.manifest_id, project_env = %env.project_env, "Rolling back");

    match restore_anchor(state, env, manifest).await {
        Ok(report) => {
            manifest.finish_stage(STAGE_ROLLBACK, true, Some(report.backup_id.clone()));
            manifest.transition(ManifestStatus::RolledBack)?;
            state.manifests.save(manifest).await?;
            info!(manifest_id = %manifest.manifest_id, "Manifest rolled back");
            Ok(report)
        }
        Err(e) => {
            let (message, diagnostic) = match e {
                DeployError::RestoreFailed { message, diagnostic } => (message, diagnostic),
                other => (other.to_string(), None),
            };
            error!(
                manifest_id = %manifest.manifest_id,
                error = %message,
                "Rollback failed, manual intervention required"
            );
            manifest.finish_stage(STAGE_ROLLBACK, false, Some(message.clone()));
            manifest.fail("restore_failed", format!("rollback failed: {}", message), true)?;
            state.manifests.save(manifest).await?;
            Err(DeployError::RestoreFailed { message, diagnostic })
        }
    }
}

async fn restore_anchor(
    state: &AppState,
    env: &ProjectEnvConfig,
    manifest: &DeploymentManifest,
) -> DeployResult<RollbackReport> {
    let backup_id = manifest
        .backup_id
        .clone()
        .ok_or_else(|| DeployError::NotFound(format!("backup reference of {}", manifest.manifest_id)))?;
    let backup = state.backups.get(&env.project_env, &backup_id).await?;

    let mut report = RestoreReport {
        backup_id: backup.id.clone(),
        files_restored: Vec::new(),
        files_removed: Vec::new(),
        image_restored: None,
        database_restored: false,
        measurement: None,
    };
    // 先恢复路由，再处理数据
    backup::restore_config(state, env, &backup, &mut report).await?;
    if backup.database.is_some() {
        with_app_stopped(state, env, async {
            backup::check_restorable(state, env, &backup).await?;
            backup::restore_database(state, env, &backup, &mut report).await
        })
        .await?;
    }

    Ok(RollbackReport {
        manifest_id: manifest.manifest_id.clone(),
        backup_id,
        restore: report,
    })
}

/// 停止应用容器后执行 `work`，结束后无论成败都重新启动容器
///
/// 容器本来就没有运行时直接执行，也不会启动它
async fn with_app_stopped<T, F>(state: &AppState, env: &ProjectEnvConfig, work: F) -> DeployResult<T>
where
    F: Future<Output = DeployResult<T>>,
{
    let Some(container) = env.app_container.as_deref() else {
        return work.await;
    };
    if !state.runtime.is_running(container).await? {
        return work.await;
    }

    state
        .runtime
        .stop_service(container)
        .await
        .map_err(|e| DeployError::RestoreFailed {
            message: format!("failed to stop {} before database restore: {}", container, e),
            diagnostic: Some(e.diagnostic()),
        })?;
    info!(container, "Application stopped for database restore");

    let result = work.await;

    match state.runtime.start_service(container).await {
        Ok(()) => info!(container, "Application started again"),
        Err(e) => {
            error!(container, error = %e, "Failed to start application after database restore");
            if result.is_ok() {
                return Err(DeployError::RestoreFailed {
                    message: format!("database restored but {} failed to start: {}", container, e),
                    diagnostic: Some(e.diagnostic()),
                });
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::proxy_config::CandidateConfig;
    use crate::services::executor;
    use crate::services::testing::{site_conf, Harness, APP};

    async fn promoted(h: &Harness, candidate: &CandidateConfig) -> DeploymentManifest {
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = DeploymentManifest::new(&h.pe(), candidate.checksum.clone(), None);
        manifest.transition(ManifestStatus::Staged).unwrap();
        let b = backup::backup(&h.state, &env, &candidate.file_names()).await.unwrap();
        executor::execute(&h.state, &env, &mut manifest, candidate, &b).await.unwrap();
        manifest
    }

    #[tokio::test]
    async fn test_rollback_restores_config_and_database() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let candidate = h.candidate(&[
            ("example.com.conf", format!("# v2\n{}", site_conf("example.com", true, true))),
            ("new.conf", "server { listen 8081; }".to_string()),
        ]);
        let mut manifest = promoted(&h, &candidate).await;
        let before = h.database.stats("myproj").unwrap();
        h.connect_app_pool(4);
        // 部署后数据被改动
        h.database.state.lock().unwrap().databases.insert(
            "myproj".to_string(),
            crate::domain::database::TableStats { table_count: 13, row_count: 1 },
        );

        let report = rollback(&h.state, &env, &mut manifest).await.unwrap();
        assert_eq!(manifest.status, ManifestStatus::RolledBack);
        assert!(report.restore.database_restored);
        assert_eq!(report.restore.files_removed, vec!["new.conf".to_string()]);
        assert_eq!(h.live_file("example.com.conf").unwrap(), site_conf("example.com", true, true));
        assert!(h.live_file("new.conf").is_none());
        assert_eq!(h.database.stats("myproj").unwrap(), before);
        let rt = h.runtime.state.lock().unwrap();
        // 切换一次 + 回滚一次
        assert_eq!(rt.reloads.len(), 2);
        // 恢复期间应用停止，之后重新启动
        assert_eq!(
            rt.service_events,
            vec![("stop", APP.to_string()), ("start", APP.to_string())]
        );
        assert!(rt.running.contains(APP));
    }

    #[tokio::test]
    async fn test_foreign_connections_still_refuse_and_app_restarts() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = promoted(&h, &h.valid_candidate("v2")).await;
        h.connect_app_pool(4);
        // 应用之外的连接（例如运维会话）
        h.database
            .state
            .lock()
            .unwrap()
            .connections
            .insert("myproj".to_string(), 1);

        let err = rollback(&h.state, &env, &mut manifest).await.unwrap_err();
        match err {
            DeployError::RestoreFailed { message, .. } => assert!(message.contains("1 active connection")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manifest.status, ManifestStatus::Failed);
        assert!(h.database.state.lock().unwrap().restored.is_empty());
        assert!(h.runtime.state.lock().unwrap().running.contains(APP));
    }

    #[tokio::test]
    async fn test_stopped_app_is_not_started_by_rollback() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = promoted(&h, &h.valid_candidate("v2")).await;
        h.runtime.state.lock().unwrap().running.remove(APP);

        rollback(&h.state, &env, &mut manifest).await.unwrap();
        let rt = h.runtime.state.lock().unwrap();
        assert!(rt.service_events.is_empty());
        assert!(!rt.running.contains(APP));
    }

    #[tokio::test]
    async fn test_rollback_failure_requires_manual_intervention() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = promoted(&h, &h.valid_candidate("v2")).await;
        h.connect_app_pool(4);
        h.database.state.lock().unwrap().fail_restore = true;

        let err = rollback(&h.state, &env, &mut manifest).await.unwrap_err();
        assert!(matches!(err, DeployError::RestoreFailed { .. }));
        assert_eq!(manifest.status, ManifestStatus::Failed);
        let failure = manifest.failure.as_ref().unwrap();
        assert!(failure.requires_manual_intervention);
        assert_eq!(failure.kind, "restore_failed");
        // 失败路径上应用同样被重新启动
        assert!(h.runtime.state.lock().unwrap().running.contains(APP));

        let stored = h.state.manifests.load(&h.pe(), &manifest.manifest_id).await.unwrap();
        assert_eq!(stored.status, ManifestStatus::Failed);
    }

    #[tokio::test]
    async fn test_proxy_lock_held_leaves_manifest_promoted() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = promoted(&h, &h.valid_candidate("v2")).await;
        let other = h.second_invocation();
        let _held = other.locks.acquire(PROXY_LOCK_KEY, "execute other/production").unwrap();

        let err = rollback(&h.state, &env, &mut manifest).await.unwrap_err();
        assert!(matches!(err, DeployError::Busy { .. }));
        assert_eq!(manifest.status, ManifestStatus::Promoted);
        assert!(h.live_file("example.com.conf").unwrap().starts_with("# v2"));
    }

    #[tokio::test]
    async fn test_rollback_rejects_non_promoted_manifest() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut manifest = DeploymentManifest::new(&h.pe(), "abc", None);

        let err = rollback(&h.state, &env, &mut manifest).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidTransition(_)));
        assert_eq!(manifest.status, ManifestStatus::Pending);
    }
}
