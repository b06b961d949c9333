//! 备份管理
//!
//! - `backup`：快照线上配置文件和应用镜像，有数据库时导出 dump
//! - `restore`：拒绝跨环境、拒绝有活跃连接的数据库，恢复配置快照并加载 dump
//! - `sweep`：删除过期备份，跳过当前清单引用的备份

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::project::ProjectEnvConfig;
use crate::domain::backup::{retention_deadline, Backup, ConfigSnapshot, DatabaseArtifact, VerificationStatus};
use crate::domain::database::TableStats;
use crate::domain::deploy::{ManifestStatus, ProjectEnvironment};
use crate::domain::proxy_config::checksum_files;
use crate::error::{DeployError, DeployResult};
use crate::infra::ToolError;
use crate::state::AppState;

use super::executor::LiveConfigWriter;

/// 创建备份
///
/// `extra_files` 为本次部署将要写入的文件，一并快照（不存在的记为 absent，回滚时删除）
pub async fn backup(
    state: &AppState,
    env: &ProjectEnvConfig,
    extra_files: &[String],
) -> DeployResult<Backup> {
    let project_env = &env.project_env;
    let mut created_at = Utc::now();
    let mut id = Backup::new_id(created_at);
    // 毫秒内重复创建
    while state.backups.get(project_env, &id).await.is_ok() {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        created_at = Utc::now();
        id = Backup::new_id(created_at);
    }

    info!(project_env = %project_env, backup_id = %id, "Creating backup");

    let result = write_artifacts(state, env, &id, extra_files).await;
    let (config, database) = match result {
        Ok(artifacts) => artifacts,
        Err(e) => {
            error!(backup_id = %id, error = %e, "Backup failed, discarding partial artifacts");
            let db_file = env
                .database
                .as_ref()
                .map(|db| format!("{}.{}", id, db.db_type.dump_extension()));
            state
                .backups
                .discard_partial(project_env, &id, db_file.as_deref())
                .await;
            return Err(match e {
                DeployError::Tool(tool) => DeployError::BackupFailed(tool.diagnostic()),
                other => other,
            });
        }
    };

    let size_bytes = database.as_ref().map_or(0, |d| d.size_bytes)
        + config_size(state, project_env, &id, &config).await;

    let backup = Backup {
        id,
        project: project_env.project.clone(),
        environment: project_env.environment,
        created_at,
        retention_deadline: retention_deadline(created_at, env.retention_days),
        size_bytes,
        config,
        database,
        verification: VerificationStatus::Unverified,
        verified_at: None,
        last_measurement: None,
    };
    // 元数据最后写入
    state.backups.save(&backup).await?;

    info!(
        project_env = %project_env,
        backup_id = %backup.id,
        size_bytes = backup.size_bytes,
        has_database = backup.database.is_some(),
        "Backup created"
    );
    Ok(backup)
}

async fn write_artifacts(
    state: &AppState,
    env: &ProjectEnvConfig,
    id: &str,
    extra_files: &[String],
) -> DeployResult<(ConfigSnapshot, Option<DatabaseArtifact>)> {
    let project_env = &env.project_env;
    let names: BTreeSet<&String> = env.config_files.iter().chain(extra_files.iter()).collect();

    let config_dir = state.backups.config_dir(project_env, id);
    fs::create_dir_all(&config_dir).await?;

    let mut contents = BTreeMap::new();
    let mut absent_files = Vec::new();
    for name in names {
        let live_path = state.config.live_conf_dir.join(name);
        match fs::read_to_string(&live_path).await {
            Ok(content) => {
                fs::write(config_dir.join(name), &content).await?;
                contents.insert(name.clone(), content);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => absent_files.push(name.clone()),
            Err(e) => return Err(e.into()),
        }
    }

    let image = match env.app_container {
        Some(ref container) => state.runtime.current_image(container).await?,
        None => None,
    };

    let config = ConfigSnapshot {
        files: contents.keys().cloned().collect(),
        absent_files,
        checksum: checksum_files(&contents, image.as_deref()),
        image,
    };

    let database = match env.database {
        Some(ref conn) => {
            let dir = state.backups.database_dir(project_env);
            fs::create_dir_all(&dir).await?;
            let file = format!("{}.{}", id, conn.db_type.dump_extension());
            let size_bytes = state.database.dump(conn, &dir.join(&file)).await?;
            if size_bytes < state.config.min_dump_bytes {
                return Err(DeployError::BackupFailed(format!(
                    "dump of {} is {} bytes, below the minimum of {}",
                    conn.database, size_bytes, state.config.min_dump_bytes
                )));
            }
            Some(DatabaseArtifact {
                engine: conn.db_type,
                database: conn.database.clone(),
                file,
                size_bytes,
            })
        }
        None => None,
    };

    Ok((config, database))
}

async fn config_size(state: &AppState, project_env: &ProjectEnvironment, id: &str, config: &ConfigSnapshot) -> u64 {
    let dir = state.backups.config_dir(project_env, id);
    let mut total = 0;
    for name in &config.files {
        if let Ok(meta) = fs::metadata(dir.join(name)).await {
            total += meta.len();
        }
    }
    total
}

/// 读取备份中的配置快照内容
pub async fn snapshot_files(state: &AppState, backup: &Backup) -> DeployResult<BTreeMap<String, String>> {
    let dir = state.backups.config_dir(&backup.project_env(), &backup.id);
    let mut files = BTreeMap::new();
    for name in &backup.config.files {
        files.insert(name.clone(), fs::read_to_string(dir.join(name)).await?);
    }
    Ok(files)
}

/// 恢复结果
#[derive(Clone, Debug, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub files_restored: Vec<String>,
    pub files_removed: Vec<String>,
    pub image_restored: Option<String>,
    pub database_restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<TableStats>,
}

/// 恢复前检查：同环境，且目标库没有活跃连接
pub async fn check_restorable(state: &AppState, env: &ProjectEnvConfig, backup: &Backup) -> DeployResult<()> {
    let source = backup.project_env();
    if source != env.project_env {
        return Err(DeployError::CrossEnvironmentRestore {
            backup: backup.id.clone(),
            source_env: source.to_string(),
            target: env.project_env.to_string(),
        });
    }
    if let (Some(artifact), Some(conn)) = (&backup.database, &env.database) {
        if artifact.database != conn.database {
            return Err(DeployError::CrossEnvironmentRestore {
                backup: backup.id.clone(),
                source_env: format!("database {}", artifact.database),
                target: format!("database {}", conn.database),
            });
        }
        let connections = state.database.active_connections(conn).await?;
        if connections > 0 {
            warn!(database = %conn.database, connections, "Refusing restore with active connections");
            return Err(DeployError::RestoreRefused {
                database: conn.database.clone(),
                connections,
            });
        }
    }
    Ok(())
}

fn restore_failed(message: &str, e: ToolError) -> DeployError {
    DeployError::RestoreFailed {
        message: format!("{}: {}", message, e),
        diagnostic: Some(e.diagnostic()),
    }
}

/// 恢复配置快照与镜像，并重新加载代理
///
/// 调用方需要持有 (项目, 环境) 锁和代理锁
pub async fn restore_config(
    state: &AppState,
    env: &ProjectEnvConfig,
    backup: &Backup,
    report: &mut RestoreReport,
) -> DeployResult<()> {
    let files = snapshot_files(state, backup).await?;
    let writer = LiveConfigWriter::apply(&state.config.live_conf_dir, &files, &backup.config.absent_files)
        .await
        .map_err(|e| DeployError::RestoreFailed {
            message: format!("failed to write config snapshot: {}", e),
            diagnostic: None,
        })?;
    report.files_restored = files.keys().cloned().collect();
    report.files_removed = writer.removed();

    if let (Some(container), Some(image)) = (&env.app_container, &backup.config.image) {
        let current = state.runtime.current_image(container).await?;
        if current.as_deref() != Some(image.as_str()) {
            state
                .runtime
                .replace_image(container, image)
                .await
                .map_err(|e| restore_failed("failed to restore image", e))?;
            report.image_restored = Some(image.clone());
        }
    }

    state
        .runtime
        .signal_reload(&state.config.proxy.container)
        .await
        .map_err(|e| restore_failed("proxy reload failed", e))?;
    Ok(())
}

/// 加载数据库 dump
pub async fn restore_database(
    state: &AppState,
    env: &ProjectEnvConfig,
    backup: &Backup,
    report: &mut RestoreReport,
) -> DeployResult<()> {
    let (Some(conn), Some(path)) = (&env.database, state.backups.database_path(backup)) else {
        return Ok(());
    };
    info!(database = %conn.database, backup_id = %backup.id, "Restoring database");
    state
        .database
        .restore(conn, &path)
        .await
        .map_err(|e| restore_failed("database restore failed", e))?;
    report.database_restored = true;

    if env.verify_on_restore {
        let stats = state.database.table_stats(conn).await?;
        if stats.is_empty() {
            warn!(database = %conn.database, "Restored database has no rows");
        }
        report.measurement = Some(stats);
    }
    Ok(())
}

/// 从备份恢复（配置 + 镜像 + 数据库）
pub async fn restore(state: &AppState, env: &ProjectEnvConfig, backup: &Backup) -> DeployResult<RestoreReport> {
    check_restorable(state, env, backup).await?;

    let mut report = RestoreReport {
        backup_id: backup.id.clone(),
        files_restored: Vec::new(),
        files_removed: Vec::new(),
        image_restored: None,
        database_restored: false,
        measurement: None,
    };
    restore_config(state, env, backup, &mut report).await?;
    restore_database(state, env, backup, &mut report).await?;

    info!(project_env = %env.project_env, backup_id = %backup.id, "Restore completed");
    Ok(report)
}

/// 跳过删除的备份
#[derive(Clone, Debug, Serialize)]
pub struct RetentionConflict {
    pub backup_id: String,
    pub manifest_id: String,
    pub reason: String,
}

/// 保留期清理结果
#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub deleted: Vec<String>,
    pub retained: Vec<String>,
    pub conflicts: Vec<RetentionConflict>,
}

/// 删除过期备份
pub async fn sweep(state: &AppState, project_env: &ProjectEnvironment, dry_run: bool) -> DeployResult<SweepReport> {
    let now = Utc::now();
    // 当前清单和尚未结束的 promoted 清单引用的备份都受保护
    let mut protected: BTreeMap<String, (String, &'static str)> = BTreeMap::new();
    if let Some(m) = state.manifests.current(project_env).await? {
        if let Some(id) = m.backup_id {
            protected.insert(id, (m.manifest_id, "referenced by current manifest"));
        }
    }
    let manifests = state.manifests.list(project_env).await?;
    for m in manifests.iter().filter(|m| m.status == ManifestStatus::Promoted) {
        if let Some(ref id) = m.backup_id {
            protected
                .entry(id.clone())
                .or_insert((m.manifest_id.clone(), "anchor of in-flight promoted manifest"));
        }
    }

    let mut report = SweepReport {
        dry_run,
        deleted: Vec::new(),
        retained: Vec::new(),
        conflicts: Vec::new(),
    };

    for backup in state.backups.list(project_env).await? {
        if !backup.is_expired(now) {
            report.retained.push(backup.id);
            continue;
        }
        if let Some((manifest_id, reason)) = protected.get(&backup.id) {
            warn!(
                backup_id = %backup.id,
                manifest_id = %manifest_id,
                "Retention conflict: expired backup is still referenced"
            );
            report.conflicts.push(RetentionConflict {
                backup_id: backup.id.clone(),
                manifest_id: manifest_id.clone(),
                reason: reason.to_string(),
            });
            report.retained.push(backup.id);
            continue;
        }
        if !dry_run {
            state.backups.delete(&backup).await?;
        }
        report.deleted.push(backup.id);
    }

    info!(
        project_env = %project_env,
        dry_run,
        deleted = report.deleted.len(),
        conflicts = report.conflicts.len(),
        "Retention sweep finished"
    );
    Ok(report)
}

/// 最新备份
pub async fn latest(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<Option<Backup>> {
    state.backups.latest(project_env).await
}
