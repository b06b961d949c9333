//! 备份校验
//!
//! 把随机抽取的近期备份恢复到唯一命名的临时库，检查表数和总行数，
//! 与上一次校验通过的度量对比后标记为 verified 或 suspect。
//! 临时库无论结果如何都会删除；不接触 production / staging 数据库。

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::config::env::constants::{SUSPECT_ROW_RATIO, VERIFY_RECENT_WINDOW};
use crate::domain::backup::{Backup, VerificationStatus};
use crate::domain::database::TableStats;
use crate::domain::deploy::ProjectEnvironment;
use crate::domain::proxy_config::checksum_files;
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

use super::backup::snapshot_files;

/// 单个备份的校验结果
#[derive(Clone, Debug, Serialize)]
pub struct VerificationOutcome {
    pub backup_id: String,
    pub project_env: String,
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<TableStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<TableStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 一次抽样校验
#[derive(Clone, Debug, Serialize)]
pub struct VerificationRun {
    pub dry_run: bool,
    pub selected: Vec<String>,
    pub outcomes: Vec<VerificationOutcome>,
    pub suspect: usize,
}

/// 临时库名：`verify_<project>_<env>_<8 位随机>`
fn scratch_name(project_env: &ProjectEnvironment) -> String {
    let project: String = project_env
        .project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "verify_{}_{}_{}",
        project,
        project_env.environment,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// 与基线对比，返回可疑原因
pub fn judge(stats: &TableStats, baseline: Option<&TableStats>) -> Option<String> {
    if stats.table_count == 0 {
        return Some("restored database has no tables".to_string());
    }
    if stats.row_count == 0 {
        return Some("restored database has no rows".to_string());
    }
    let baseline = baseline?;
    if stats.table_count < baseline.table_count {
        return Some(format!(
            "table count dropped from {} to {}",
            baseline.table_count, stats.table_count
        ));
    }
    if (stats.row_count as f64) < baseline.row_count as f64 * SUSPECT_ROW_RATIO {
        return Some(format!(
            "row count dropped from {} to {}",
            baseline.row_count, stats.row_count
        ));
    }
    None
}

/// 最近一次通过校验的度量（早于当前备份）
async fn baseline_for(state: &AppState, backup: &Backup) -> DeployResult<Option<TableStats>> {
    let previous = state
        .backups
        .list(&backup.project_env())
        .await?
        .into_iter()
        .rev()
        .filter(|b| b.id < backup.id && b.verification == VerificationStatus::Verified)
        .find_map(|b| b.last_measurement);
    Ok(previous.or(backup.last_measurement))
}

/// 重新计算配置快照的校验和
async fn check_config_snapshot(state: &AppState, backup: &Backup) -> Option<String> {
    match snapshot_files(state, backup).await {
        Ok(files) => {
            let checksum = checksum_files(&files, backup.config.image.as_deref());
            if checksum == backup.config.checksum {
                None
            } else {
                Some("config snapshot checksum mismatch".to_string())
            }
        }
        Err(e) => Some(format!("config snapshot unreadable: {}", e)),
    }
}

/// 恢复到临时库并度量，临时库总是删除
async fn measure_dump(state: &AppState, backup: &Backup) -> DeployResult<Result<TableStats, String>> {
    let project_env = backup.project_env();
    let env = state.registry.resolve(&project_env)?;
    let conn = env.database.ok_or_else(|| {
        DeployError::Config(format!("{} no longer has a database configured", project_env))
    })?;
    let dump = state
        .backups
        .database_path(backup)
        .ok_or_else(|| DeployError::NotFound(format!("dump of {}", backup.id)))?;

    let scratch = conn.with_database(scratch_name(&project_env));
    info!(backup_id = %backup.id, scratch = %scratch.database, "Restoring backup into scratch database");

    let measured = match state.database.restore_into_new(&scratch, &dump).await {
        Ok(()) => state
            .database
            .table_stats(&scratch)
            .await
            .map_err(|e| format!("failed to measure scratch database: {}", e.diagnostic())),
        Err(e) => Err(format!("restore failed: {}", e.diagnostic())),
    };

    if let Err(e) = state.database.drop_database(&scratch).await {
        error!(scratch = %scratch.database, error = %e, "Failed to drop scratch database");
    }
    Ok(measured)
}

/// 校验单个备份并持久化结果
pub async fn verify_backup(state: &AppState, backup: &mut Backup) -> DeployResult<VerificationOutcome> {
    let baseline = baseline_for(state, backup).await?;
    let mut reason = check_config_snapshot(state, backup).await;
    let mut measurement = None;

    if backup.database.is_some() {
        match measure_dump(state, backup).await? {
            Ok(stats) => {
                measurement = Some(stats);
                if reason.is_none() {
                    reason = judge(&stats, baseline.as_ref());
                }
            }
            Err(e) => reason = reason.or(Some(e)),
        }
    }

    let status = if reason.is_some() {
        VerificationStatus::Suspect
    } else {
        VerificationStatus::Verified
    };
    backup.verification = status;
    backup.verified_at = Some(Utc::now());
    if measurement.is_some() {
        backup.last_measurement = measurement;
    }
    state.backups.save(backup).await?;

    match status {
        VerificationStatus::Suspect => warn!(
            backup_id = %backup.id,
            reason = reason.as_deref().unwrap_or(""),
            "Backup marked suspect"
        ),
        _ => info!(backup_id = %backup.id, "Backup verified"),
    }

    Ok(VerificationOutcome {
        backup_id: backup.id.clone(),
        project_env: backup.project_env().to_string(),
        status,
        measurement,
        baseline,
        reason,
    })
}

/// 从近期备份中随机抽样校验
pub async fn verify_backups(
    state: &AppState,
    filter: Option<&ProjectEnvironment>,
    sample: usize,
    dry_run: bool,
) -> DeployResult<VerificationRun> {
    let environments = match filter {
        Some(pe) => vec![pe.clone()],
        None => state.registry.environments(),
    };

    let mut pool = Vec::new();
    for pe in &environments {
        let backups = state.backups.list(pe).await?;
        let skip = backups.len().saturating_sub(VERIFY_RECENT_WINDOW);
        pool.extend(backups.into_iter().skip(skip));
    }

    let mut selected: Vec<Backup> = {
        let mut rng = rand::thread_rng();
        pool.choose_multiple(&mut rng, sample).cloned().collect()
    };
    selected.sort_by(|a, b| (a.project_env(), &a.id).cmp(&(b.project_env(), &b.id)));

    let mut run = VerificationRun {
        dry_run,
        selected: selected.iter().map(|b| format!("{}:{}", b.project_env(), b.id)).collect(),
        outcomes: Vec::new(),
        suspect: 0,
    };
    if dry_run {
        return Ok(run);
    }

    let mut by_env: BTreeMap<String, usize> = BTreeMap::new();
    for mut backup in selected {
        if state.cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        let outcome = verify_backup(state, &mut backup).await?;
        if outcome.status == VerificationStatus::Suspect {
            run.suspect += 1;
        }
        *by_env.entry(outcome.project_env.clone()).or_default() += 1;
        run.outcomes.push(outcome);
    }

    info!(
        verified = run.outcomes.len(),
        suspect = run.suspect,
        environments = by_env.len(),
        "Backup verification finished"
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backup;
    use crate::services::testing::Harness;

    #[test]
    fn test_judge_rules() {
        let good = TableStats { table_count: 10, row_count: 1000 };
        assert!(judge(&good, None).is_none());
        assert!(judge(&good, Some(&good)).is_none());
        assert!(judge(&TableStats { table_count: 0, row_count: 0 }, None).is_some());
        assert!(judge(&TableStats { table_count: 9, row_count: 1000 }, Some(&good)).is_some());
        assert!(judge(&TableStats { table_count: 10, row_count: 499 }, Some(&good)).is_some());
        assert!(judge(&TableStats { table_count: 10, row_count: 500 }, Some(&good)).is_none());
    }

    #[test]
    fn test_scratch_name_is_db_safe() {
        let pe: ProjectEnvironment = "my-proj/production".parse().unwrap();
        let name = scratch_name(&pe);
        assert!(name.starts_with("verify_my_proj_production_"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[tokio::test]
    async fn test_verify_marks_verified_and_drops_scratch() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut b = backup::backup(&h.state, &env, &[]).await.unwrap();

        let outcome = verify_backup(&h.state, &mut b).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.measurement, Some(TableStats { table_count: 12, row_count: 3400 }));

        let db = h.database.state.lock().unwrap();
        assert_eq!(db.dropped.len(), 1);
        assert!(db.dropped[0].starts_with("verify_myproj_production_"));
        assert!(!db.databases.contains_key(&db.dropped[0]));
        // 生产库没被碰过
        assert!(db.restored.is_empty());
        drop(db);

        let stored = h.state.backups.get(&h.pe(), &b.id).await.unwrap();
        assert_eq!(stored.verification, VerificationStatus::Verified);
        assert!(stored.last_measurement.is_some());
    }

    #[tokio::test]
    async fn test_shrunken_backup_is_suspect() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut first = backup::backup(&h.state, &env, &[]).await.unwrap();
        verify_backup(&h.state, &mut first).await.unwrap();

        h.database.state.lock().unwrap().databases.insert(
            "myproj".to_string(),
            TableStats { table_count: 12, row_count: 10 },
        );
        let mut second = backup::backup(&h.state, &env, &[]).await.unwrap();
        let outcome = verify_backup(&h.state, &mut second).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Suspect);
        assert!(outcome.reason.unwrap().contains("row count"));
    }

    #[tokio::test]
    async fn test_failed_scratch_restore_is_suspect_and_still_dropped() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut b = backup::backup(&h.state, &env, &[]).await.unwrap();
        h.database.state.lock().unwrap().fail_restore = true;

        let outcome = verify_backup(&h.state, &mut b).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Suspect);
        let db = h.database.state.lock().unwrap();
        assert_eq!(db.dropped.len(), 1);
        assert!(!db.databases.keys().any(|k| k.starts_with("verify_")));
    }

    #[tokio::test]
    async fn test_tampered_config_snapshot_is_suspect() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let mut b = backup::backup(&h.state, &env, &[]).await.unwrap();
        let snapshot = h.state.backups.config_dir(&h.pe(), &b.id).join("example.com.conf");
        std::fs::write(snapshot, "# tampered").unwrap();

        let outcome = verify_backup(&h.state, &mut b).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Suspect);
        assert!(outcome.reason.unwrap().contains("checksum"));
    }

    #[tokio::test]
    async fn test_sampling_and_dry_run() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        for _ in 0..3 {
            backup::backup(&h.state, &env, &[]).await.unwrap();
        }

        let dry = verify_backups(&h.state, Some(&h.pe()), 2, true).await.unwrap();
        assert_eq!(dry.selected.len(), 2);
        assert!(dry.outcomes.is_empty());
        assert!(h.database.state.lock().unwrap().dropped.is_empty());

        let run = verify_backups(&h.state, None, 5, false).await.unwrap();
        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(run.suspect, 0);
    }
}
