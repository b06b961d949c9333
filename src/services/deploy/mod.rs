//! 部署流水线
//!
//! 每次调用顺序执行：加锁 → staging → 闸门 → 备份 → 生产切换 → 健康检查，
//! 健康检查失败时自动回滚。清单在每次状态迁移后持久化，中断后可以 `resume`。

pub mod context;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::deploy::{
    DeployStage, DeploymentManifest, ManifestStatus, ManifestSummary, ProjectEnvironment,
};
use crate::domain::health::HealthReport;
use crate::domain::proxy_config::CandidateConfig;
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

use super::gate::{self, GateDecision, OperatorIntent};
use super::rollback::{self, RollbackReport};
use super::staging::{self, StagingResult};
use super::{backup, executor, health};

pub use context::DeployContext;
use context::{STAGE_APPROVAL, STAGE_BACKUP, STAGE_HEALTH, STAGE_ROLLBACK, STAGE_STAGING, STAGE_SWITCH};

/// 部署请求
#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub project_env: ProjectEnvironment,
    pub candidate: CandidateConfig,
    pub intent: OperatorIntent,
}

/// 成功部署的报告
#[derive(Clone, Debug, Serialize)]
pub struct DeployOutcome {
    pub manifest: ManifestSummary,
    /// 复用了之前 staged 的清单
    pub reused_staging: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging: Option<HealthReport>,
    pub health: HealthReport,
    pub stages: Vec<DeployStage>,
}

impl DeployOutcome {
    fn new(ctx: &DeployContext<'_>, staging: Option<HealthReport>, health: HealthReport) -> Self {
        Self {
            manifest: ctx.manifest.summary(),
            reused_staging: staging.is_none(),
            staging,
            health,
            stages: ctx.manifest.stages.clone(),
        }
    }
}

/// 执行一次部署
pub async fn deploy(state: &AppState, request: DeployRequest) -> DeployResult<DeployOutcome> {
    let project_env = &request.project_env;
    // 锁在 staging 之前获取
    let _lock = state.locks.acquire(&project_env.key(), "deploy")?;
    let env = state.registry.resolve(project_env)?;

    info!(
        project_env = %project_env,
        checksum = %request.candidate.checksum,
        intent = ?request.intent,
        "Deployment requested"
    );

    let reusable = settle_staged(state, project_env, &request.candidate.checksum, request.intent).await?;

    let (mut ctx, staging_report) = match reusable {
        Some(manifest) => {
            info!(manifest_id = %manifest.manifest_id, "Reusing staged manifest");
            (DeployContext::new(state, env, manifest), None)
        }
        None => {
            let manifest = DeploymentManifest::new(
                project_env,
                request.candidate.checksum.clone(),
                request.candidate.image.clone(),
            );
            let mut ctx = DeployContext::new(state, env, manifest);
            ctx.save().await?;
            let report = stage(&mut ctx, &request.candidate, request.intent).await?;
            (ctx, Some(report))
        }
    };

    let approval = match request.intent {
        OperatorIntent::Force => "forced",
        _ => "confirmed",
    };
    ctx.start_stage(STAGE_APPROVAL).await?;
    ctx.finish_stage(STAGE_APPROVAL, true, Some(approval.to_string())).await?;

    promote(&mut ctx, &request.candidate).await?;
    let health = verify_promoted(&mut ctx).await?;
    Ok(DeployOutcome::new(&ctx, staging_report, health))
}

/// 处理已有的 staged 清单：返回可复用的一个，其余标记为 superseded
async fn settle_staged(
    state: &AppState,
    project_env: &ProjectEnvironment,
    checksum: &str,
    intent: OperatorIntent,
) -> DeployResult<Option<DeploymentManifest>> {
    let window = chrono::Duration::from_std(state.config.staging_reuse_window)
        .unwrap_or_else(|_| chrono::Duration::zero());
    let now = Utc::now();

    let staged: Vec<DeploymentManifest> = state
        .manifests
        .list(project_env)
        .await?
        .into_iter()
        .rev()
        .filter(|m| m.status == ManifestStatus::Staged)
        .collect();

    let mut reusable = None;
    for mut manifest in staged {
        let fresh = manifest
            .entered_at(ManifestStatus::Staged)
            .map_or(false, |at| now - at < window);
        if reusable.is_none()
            && intent != OperatorIntent::None
            && manifest.candidate_checksum == checksum
            && fresh
        {
            reusable = Some(manifest);
            continue;
        }
        info!(manifest_id = %manifest.manifest_id, "Superseding staged manifest");
        manifest.fail("superseded", "superseded by a newer deployment attempt", false)?;
        state.manifests.save(&manifest).await?;
    }
    Ok(reusable)
}

/// staging + 闸门；通过时清单进入 staged
async fn stage(
    ctx: &mut DeployContext<'_>,
    candidate: &CandidateConfig,
    intent: OperatorIntent,
) -> DeployResult<HealthReport> {
    ctx.start_stage(STAGE_STAGING).await?;
    let result = match staging::run_staging(ctx.state, &ctx.env, candidate).await {
        Ok(result) => result,
        Err(e) => return halt(ctx, STAGE_STAGING, e).await,
    };

    let decision = gate::decide(&result, intent);
    let report = match result {
        StagingResult::Passed { report } => report,
        other => {
            let err = other.into_error().unwrap_or_else(|| DeployError::StagingFailed {
                message: "staging did not pass".to_string(),
                results: Vec::new(),
            });
            return halt(ctx, STAGE_STAGING, err).await;
        }
    };

    ctx.finish_stage(
        STAGE_STAGING,
        true,
        Some(format!("{} probe(s) passed", report.results.len())),
    )
    .await?;
    ctx.manifest.transition(ManifestStatus::Staged)?;
    ctx.save().await?;

    if decision == GateDecision::AwaitingApproval {
        info!(
            manifest_id = %ctx.manifest.manifest_id,
            "Staging passed, awaiting approval (re-run with --confirm)"
        );
        ctx.log_summary();
        return Err(DeployError::AwaitingApproval {
            manifest_id: ctx.manifest.manifest_id.clone(),
        });
    }
    Ok(report)
}

/// 阶段失败：记录阶段、标记清单失败并返回错误
async fn halt<T>(ctx: &mut DeployContext<'_>, stage: &str, err: DeployError) -> DeployResult<T> {
    ctx.finish_stage(stage, false, Some(err.to_string())).await?;
    ctx.fail(err.kind(), err.to_string(), false).await?;
    ctx.log_summary();
    Err(err)
}

/// 备份 + 切换；成功后清单为 promoted
async fn promote(ctx: &mut DeployContext<'_>, candidate: &CandidateConfig) -> DeployResult<()> {
    if ctx.is_cancelled() {
        return halt(ctx, STAGE_BACKUP, DeployError::Cancelled).await;
    }

    ctx.start_stage(STAGE_BACKUP).await?;
    let backup = match backup::backup(ctx.state, &ctx.env, &candidate.file_names()).await {
        Ok(backup) => backup,
        Err(e) => {
            let err = match e {
                DeployError::BackupFailed(_) => e,
                other => DeployError::BackupFailed(other.to_string()),
            };
            return halt(ctx, STAGE_BACKUP, err).await;
        }
    };
    ctx.finish_stage(STAGE_BACKUP, true, Some(backup.id.clone())).await?;

    if ctx.is_cancelled() {
        return halt(ctx, STAGE_SWITCH, DeployError::Cancelled).await;
    }

    ctx.start_stage(STAGE_SWITCH).await?;
    if let Err(e) = executor::execute(ctx.state, &ctx.env, &mut ctx.manifest, candidate, &backup).await {
        // 切换失败时执行器已记录阶段并标记 failed；代理锁被占用时清单仍为 staged，可稍后 --confirm
        if !ctx.manifest.status.is_terminal() {
            ctx.finish_stage(STAGE_SWITCH, false, Some(e.to_string())).await?;
        }
        ctx.log_summary();
        return Err(e);
    }
    ctx.finish_stage(STAGE_SWITCH, true, None).await
}

/// 对 promoted 清单做健康检查：通过则 healthy，否则自动回滚
async fn verify_promoted(ctx: &mut DeployContext<'_>) -> DeployResult<HealthReport> {
    ctx.start_stage(STAGE_HEALTH).await?;
    let report = match health::verify_environment(ctx.state, &ctx.env).await {
        Ok(report) => report,
        Err(e) => {
            // 清单保持 promoted，之后可 resume 或 rollback
            warn!(manifest_id = %ctx.manifest.manifest_id, error = %e, "Health verification interrupted");
            ctx.finish_stage(STAGE_HEALTH, false, Some(e.to_string())).await?;
            ctx.log_summary();
            return Err(e);
        }
    };
    ctx.manifest.health_passed = Some(report.passed);

    if report.passed {
        ctx.finish_stage(STAGE_HEALTH, true, None).await?;
        ctx.skip_stage(STAGE_ROLLBACK, "not needed").await?;
        ctx.manifest.transition(ManifestStatus::Healthy)?;
        ctx.save().await?;
        ctx.log_summary();
        return Ok(report);
    }

    let summary = report.failure_summary();
    ctx.finish_stage(STAGE_HEALTH, false, Some(summary.clone())).await?;
    warn!(manifest_id = %ctx.manifest.manifest_id, "Health check failed, rolling back automatically");

    ctx.start_stage(STAGE_ROLLBACK).await?;
    let result = rollback::rollback(ctx.state, &ctx.env, &mut ctx.manifest).await;
    let outcome = match result {
        Ok(_) => Err(DeployError::HealthCheckFailed {
            manifest_id: ctx.manifest.manifest_id.clone(),
            summary,
            rolled_back: true,
        }),
        Err(DeployError::Busy { key, holder }) => {
            // 回滚没有开始，生产仍是新版本
            let message = format!("rollback deferred: {} is locked by {}", key, holder);
            warn!(
                manifest_id = %ctx.manifest.manifest_id,
                key = %key,
                holder = %holder,
                "Automatic rollback could not start, run `rollback` once the lock is free"
            );
            ctx.finish_stage(STAGE_ROLLBACK, false, Some(message.clone())).await?;
            Err(DeployError::HealthCheckFailed {
                manifest_id: ctx.manifest.manifest_id.clone(),
                summary: format!("{}; {}", summary, message),
                rolled_back: false,
            })
        }
        Err(e) => {
            if !ctx.manifest.status.is_terminal() {
                ctx.finish_stage(STAGE_ROLLBACK, false, Some(e.to_string())).await?;
            }
            Err(e)
        }
    };
    ctx.log_summary();
    outcome
}

/// 最新清单必须是 promoted
async fn latest_promoted(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<DeploymentManifest> {
    match state.manifests.latest(project_env).await? {
        Some(manifest) if manifest.status == ManifestStatus::Promoted => Ok(manifest),
        Some(manifest) => Err(DeployError::NotFound(format!(
            "promoted manifest for {} (latest {} is {})",
            project_env, manifest.manifest_id, manifest.status
        ))),
        None => Err(DeployError::NotFound(format!("manifest for {}", project_env))),
    }
}

/// 中断后继续：重新检查 promoted 清单的健康状态
pub async fn resume(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<DeployOutcome> {
    let _lock = state.locks.acquire(&project_env.key(), "resume")?;
    let env = state.registry.resolve(project_env)?;
    let manifest = latest_promoted(state, project_env).await?;
    info!(manifest_id = %manifest.manifest_id, project_env = %project_env, "Resuming promoted manifest");

    let mut ctx = DeployContext::new(state, env, manifest);
    let health = verify_promoted(&mut ctx).await?;
    Ok(DeployOutcome {
        manifest: ctx.manifest.summary(),
        reused_staging: false,
        staging: None,
        health,
        stages: ctx.manifest.stages.clone(),
    })
}

/// 手动回滚最新的 promoted 清单
pub async fn rollback_latest(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<RollbackReport> {
    let _lock = state.locks.acquire(&project_env.key(), "rollback")?;
    let env = state.registry.resolve(project_env)?;
    let manifest = latest_promoted(state, project_env).await?;

    let mut ctx = DeployContext::new(state, env, manifest);
    ctx.start_stage(STAGE_ROLLBACK).await?;
    let result = rollback::rollback(ctx.state, &ctx.env, &mut ctx.manifest).await;
    // 终态下阶段已由 rollback 记录
    if let Err(ref e) = result {
        if !ctx.manifest.status.is_terminal() {
            ctx.finish_stage(STAGE_ROLLBACK, false, Some(e.to_string())).await?;
        }
    }
    ctx.log_summary();
    result
}

/// 最新清单摘要
pub async fn status(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<ManifestSummary> {
    state
        .manifests
        .latest(project_env)
        .await?
        .map(|m| m.summary())
        .ok_or_else(|| DeployError::NotFound(format!("manifest for {}", project_env)))
}

/// 全部清单摘要，新的在前
pub async fn history(state: &AppState, project_env: &ProjectEnvironment) -> DeployResult<Vec<ManifestSummary>> {
    Ok(state
        .manifests
        .list(project_env)
        .await?
        .iter()
        .rev()
        .map(|m| m.summary())
        .collect())
}
