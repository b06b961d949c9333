//! Staging 验证
//!
//! 在绑定到 staging 端口的独立代理容器中加载候选配置并探测。
//! 无论成功、失败还是被取消，staging 容器都会被销毁。

use serde::Serialize;
use tracing::{info, warn};

use crate::config::project::ProjectEnvConfig;
use crate::domain::deploy::ProjectEnvironment;
use crate::domain::health::{HealthCheckResult, HealthReport};
use crate::domain::proxy_config::{CandidateConfig, Violation};
use crate::error::{DeployError, DeployResult};
use crate::infra::{InstanceSpec, Mount, PortBinding};
use crate::state::AppState;

use super::{health, validator};

/// staging 结果
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StagingResult {
    Passed { report: HealthReport },
    /// 未通过校验，未启动任何实例
    Rejected { violations: Vec<Violation> },
    Failed { report: HealthReport },
    /// staging 实例已在运行
    Busy { identity: String },
}

impl StagingResult {
    pub fn passed(&self) -> bool {
        matches!(self, StagingResult::Passed { .. })
    }

    /// 转换为错误（未通过时）
    pub fn into_error(self) -> Option<DeployError> {
        match self {
            StagingResult::Passed { .. } => None,
            StagingResult::Rejected { violations } => Some(DeployError::ValidationFailed(violations)),
            StagingResult::Failed { report } => Some(DeployError::StagingFailed {
                message: report.failure_summary(),
                results: report.results,
            }),
            StagingResult::Busy { identity } => Some(DeployError::Busy {
                key: identity,
                holder: "running staging instance".to_string(),
            }),
        }
    }
}

/// staging 容器名
pub fn staging_identity(project_env: &ProjectEnvironment) -> String {
    format!(
        "rollout-staging-{}-{}",
        project_env.project, project_env.environment
    )
}

fn staging_spec(state: &AppState, identity: &str, conf_dir: &std::path::Path) -> InstanceSpec {
    let proxy = &state.config.proxy;
    InstanceSpec {
        identity: identity.to_string(),
        image: proxy.image.clone(),
        mounts: vec![
            Mount::read_only(conf_dir, proxy.conf_mount.clone()),
            Mount::read_only(state.config.cert_dir.clone(), state.config.cert_mount.clone()),
        ],
        ports: vec![
            PortBinding {
                host: proxy.staging_port,
                container: 443,
                protocol: "tcp",
            },
            PortBinding {
                host: proxy.staging_port,
                container: 443,
                protocol: "udp",
            },
        ],
        network: proxy.network.clone(),
        command: Vec::new(),
    }
}

/// 运行 staging 验证
pub async fn run_staging(
    state: &AppState,
    env: &ProjectEnvConfig,
    candidate: &CandidateConfig,
) -> DeployResult<StagingResult> {
    let identity = staging_identity(&env.project_env);
    if state.runtime.is_running(&identity).await? {
        warn!(identity = %identity, "Staging instance already running");
        return Ok(StagingResult::Busy { identity });
    }

    let report = validator::validate(state, candidate).await?;
    if !report.passed {
        return Ok(StagingResult::Rejected {
            violations: report.violations,
        });
    }

    let assembled = validator::assemble(state, candidate).await?;
    let conf_dir = assembled.materialize().await?;
    let spec = staging_spec(state, &identity, conf_dir.path());

    info!(
        identity = %identity,
        port = state.config.proxy.staging_port,
        checksum = %candidate.checksum,
        "Starting staging instance"
    );

    let outcome = match state.runtime.start(&spec).await {
        Ok(()) => {
            let probes = health::staging_probes(state, env, &identity);
            tokio::select! {
                result = health::verify(state, &probes, state.config.timeouts.health_budget) => result,
                _ = state.cancel.cancelled() => Err(DeployError::Cancelled),
            }
        }
        Err(e) => Ok(HealthReport {
            passed: false,
            results: vec![HealthCheckResult::failed(
                format!("container:{}", identity),
                format!("failed to start: {}", e.diagnostic()),
                0,
            )],
            attempts: 1,
            elapsed_ms: 0,
        }),
    };

    // 无条件销毁
    if let Err(e) = state.runtime.stop(&identity).await {
        warn!(identity = %identity, error = %e, "Failed to tear down staging instance");
    } else {
        info!(identity = %identity, "Staging instance torn down");
    }

    let report = outcome?;
    Ok(if report.passed {
        StagingResult::Passed { report }
    } else {
        StagingResult::Failed { report }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{site_conf, Harness};

    #[tokio::test]
    async fn test_staging_passes_and_tears_down() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let result = run_staging(&h.state, &env, &h.valid_candidate("v2")).await.unwrap();

        assert!(result.passed());
        let rt = h.runtime.state.lock().unwrap();
        assert_eq!(rt.started.len(), 1);
        let spec = &rt.started[0];
        assert_eq!(spec.identity, "rollout-staging-myproj-production");
        assert!(spec.mounts.iter().all(|m| m.read_only));
        assert!(spec.ports.iter().all(|p| p.host == 8443));
        assert!(!rt.running.contains(&spec.identity));
        assert!(rt.stopped.contains(&spec.identity));
        // 探测走 staging 端口
        let calls = h.prober.calls.lock().unwrap();
        assert!(calls.iter().all(|(url, addr)| url.contains(":8443") && addr.is_some()));
    }

    #[tokio::test]
    async fn test_rejected_candidate_starts_nothing() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let candidate = h.candidate(&[("other.conf", site_conf("other.example.com", true, true))]);

        let result = run_staging(&h.state, &env, &candidate).await.unwrap();
        assert!(matches!(result, StagingResult::Rejected { .. }));
        assert!(h.runtime.state.lock().unwrap().started.is_empty());
        assert!(matches!(result.into_error(), Some(DeployError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_probes_still_tear_down() {
        let h = Harness::new().await;
        h.prober.set_status(0);
        let env = h.state.registry.resolve(&h.pe()).unwrap();

        let result = run_staging(&h.state, &env, &h.valid_candidate("v2")).await.unwrap();
        assert!(matches!(result, StagingResult::Failed { .. }));
        let rt = h.runtime.state.lock().unwrap();
        assert!(!rt.running.contains("rollout-staging-myproj-production"));
    }

    #[tokio::test]
    async fn test_running_staging_instance_is_busy() {
        let h = Harness::new().await;
        h.runtime
            .state
            .lock()
            .unwrap()
            .running
            .insert("rollout-staging-myproj-production".to_string());
        let env = h.state.registry.resolve(&h.pe()).unwrap();

        let result = run_staging(&h.state, &env, &h.valid_candidate("v2")).await.unwrap();
        assert!(matches!(result, StagingResult::Busy { .. }));
        assert_eq!(h.runtime.state.lock().unwrap().config_tests, 0);
    }

    #[tokio::test]
    async fn test_cancelled_staging_still_tears_down() {
        let h = Harness::new().await;
        h.prober.set_status(0);
        h.state.cancel.cancel();
        let env = h.state.registry.resolve(&h.pe()).unwrap();

        let err = run_staging(&h.state, &env, &h.valid_candidate("v2")).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert!(!h
            .runtime
            .state
            .lock()
            .unwrap()
            .running
            .contains("rollout-staging-myproj-production"));
    }
}
