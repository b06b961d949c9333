//! 健康校验
//!
//! 每个探测有独立超时；失败的探测按指数退避重试，全部重试都在总预算内完成。
//! 任一必需探测重试耗尽即整体失败。只读，可重复执行。

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::project::ProjectEnvConfig;
use crate::domain::health::{HealthCheckResult, HealthProbe, HealthReport};
use crate::error::{DeployError, DeployResult};
use crate::state::AppState;

/// 健康检查地址
fn health_url(domain: &str, port: Option<u16>, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    match port {
        Some(port) => format!("https://{}:{}{}", domain, port, path),
        None => format!("https://{}{}", domain, path),
    }
}

/// 生产探测：每个域名的 HTTPS 存活、代理容器健康、可选代理状态页
pub fn production_probes(state: &AppState, env: &ProjectEnvConfig) -> Vec<HealthProbe> {
    let mut probes: Vec<HealthProbe> = env
        .domains
        .iter()
        .map(|domain| HealthProbe::Http {
            url: health_url(domain, None, &env.health_path),
            expected_status: 200,
            resolve_to: None,
            required: true,
        })
        .collect();

    probes.push(HealthProbe::Container {
        identity: state.config.proxy.container.clone(),
        required: true,
    });

    if let Some(ref url) = state.config.proxy.status_url {
        probes.push(HealthProbe::Http {
            url: url.clone(),
            expected_status: 200,
            resolve_to: None,
            required: false,
        });
    }
    probes
}

/// staging 探测：生产域名解析到本机 staging 端口
pub fn staging_probes(state: &AppState, env: &ProjectEnvConfig, identity: &str) -> Vec<HealthProbe> {
    let port = state.config.proxy.staging_port;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut probes: Vec<HealthProbe> = env
        .domains
        .iter()
        .map(|domain| HealthProbe::Http {
            url: health_url(domain, Some(port), &env.health_path),
            expected_status: 200,
            resolve_to: Some(addr),
            required: true,
        })
        .collect();
    probes.push(HealthProbe::Container {
        identity: identity.to_string(),
        required: true,
    });
    probes
}

async fn run_probe(state: &AppState, probe: &HealthProbe, timeout: Duration) -> HealthCheckResult {
    let started = Instant::now();
    let target = probe.target();

    match probe {
        HealthProbe::Http {
            url,
            expected_status,
            resolve_to,
            ..
        } => {
            let outcome =
                tokio::time::timeout(timeout, state.prober.probe(url, *resolve_to, timeout)).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(status)) => HealthCheckResult {
                    target,
                    expected_status: Some(*expected_status),
                    observed_status: Some(status),
                    latency_ms,
                    passed: status == *expected_status,
                    error: None,
                },
                Ok(Err(e)) => HealthCheckResult {
                    expected_status: Some(*expected_status),
                    ..HealthCheckResult::failed(target, e.to_string(), latency_ms)
                },
                Err(_) => HealthCheckResult {
                    expected_status: Some(*expected_status),
                    ..HealthCheckResult::failed(target, format!("timed out after {:?}", timeout), latency_ms)
                },
            }
        }
        HealthProbe::Container { identity, .. } => {
            let outcome = tokio::time::timeout(timeout, state.runtime.is_healthy(identity)).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(true)) => HealthCheckResult {
                    target,
                    expected_status: None,
                    observed_status: None,
                    latency_ms,
                    passed: true,
                    error: None,
                },
                Ok(Ok(false)) => HealthCheckResult::failed(target, "container is not healthy", latency_ms),
                Ok(Err(e)) => HealthCheckResult::failed(target, e.to_string(), latency_ms),
                Err(_) => HealthCheckResult::failed(target, format!("timed out after {:?}", timeout), latency_ms),
            }
        }
    }
}

/// 执行一组探测
pub async fn verify(state: &AppState, probes: &[HealthProbe], budget: Duration) -> DeployResult<HealthReport> {
    let started = Instant::now();
    let retry = &state.config.retry;
    let mut results: Vec<Option<HealthCheckResult>> = vec![None; probes.len()];
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        for (probe, slot) in probes.iter().zip(results.iter_mut()) {
            if slot.as_ref().map_or(false, |r| r.passed) {
                continue;
            }
            // 单个探测不能超出剩余预算
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                *slot = Some(HealthCheckResult::failed(probe.target(), "health budget exhausted", 0));
                continue;
            }
            let result = run_probe(state, probe, state.config.timeouts.probe.min(remaining)).await;
            debug!(target = %result.target, passed = result.passed, attempt = attempts, "Probe finished");
            *slot = Some(result);
        }

        let pending = probes
            .iter()
            .zip(results.iter())
            .filter(|(p, r)| p.is_required() && !r.as_ref().map_or(false, |r| r.passed))
            .count();
        if pending == 0 {
            break;
        }

        let elapsed = started.elapsed();
        if attempts > retry.max_retries || elapsed >= budget {
            break;
        }
        let wait = retry.backoff(attempts).min(budget - elapsed);
        debug!(pending, attempt = attempts, wait_ms = wait.as_millis() as u64, "Retrying failed probes");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = state.cancel.cancelled() => return Err(DeployError::Cancelled),
        }
    }

    let results: Vec<HealthCheckResult> = results.into_iter().flatten().collect();
    let passed = probes
        .iter()
        .zip(results.iter())
        .all(|(p, r)| !p.is_required() || r.passed);

    let report = HealthReport {
        passed,
        results,
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    if passed {
        info!(attempts, elapsed_ms = report.elapsed_ms, "Health verification passed");
    } else {
        warn!(attempts, failures = %report.failure_summary(), "Health verification failed");
    }
    Ok(report)
}

/// 校验某个 (项目, 环境) 的生产健康状态
pub async fn verify_environment(state: &AppState, env: &ProjectEnvConfig) -> DeployResult<HealthReport> {
    let probes = production_probes(state, env);
    verify(state, &probes, state.config.timeouts.health_budget).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{Harness, PROXY};

    #[test]
    fn test_health_url() {
        assert_eq!(health_url("example.com", None, "/health"), "https://example.com/health");
        assert_eq!(health_url("example.com", Some(8443), "health"), "https://example.com:8443/health");
    }

    #[tokio::test]
    async fn test_all_probes_pass_first_attempt() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let report = verify_environment(&h.state, &env).await.unwrap();

        assert!(report.passed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.results.len(), 2);
        assert_eq!(h.prober.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_probe_exhausts_retries() {
        let h = Harness::new().await;
        h.prober.set_status(502);
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let report = verify_environment(&h.state, &env).await.unwrap();

        assert!(!report.passed);
        // 首次 + 3 次重试
        assert_eq!(report.attempts, 4);
        assert_eq!(h.prober.call_count(), 4);
        assert!(report.failure_summary().contains("status 502"));
    }

    #[tokio::test]
    async fn test_unhealthy_proxy_container_fails() {
        let h = Harness::new().await;
        h.runtime.state.lock().unwrap().unhealthy.insert(PROXY.to_string());
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let report = verify_environment(&h.state, &env).await.unwrap();

        assert!(!report.passed);
        assert!(report.failure_summary().contains("container:platform-nginx"));
    }

    #[tokio::test]
    async fn test_optional_probe_does_not_fail_check() {
        let h = Harness::new().await;
        h.prober.set_status(503);
        let probes = vec![HealthProbe::Http {
            url: "http://127.0.0.1/nginx_status".to_string(),
            expected_status: 200,
            resolve_to: None,
            required: false,
        }];
        let report = verify(&h.state, &probes, Duration::from_secs(1)).await.unwrap();
        assert!(report.passed);
        assert!(!report.results[0].passed);
    }

    #[tokio::test]
    async fn test_slow_probes_stay_within_budget() {
        let mut h = Harness::new().await;
        h.state.config.timeouts.probe = Duration::from_secs(10);
        h.prober.set_delay(Duration::from_secs(5));
        let probes: Vec<HealthProbe> = ["a.example.com", "b.example.com", "c.example.com"]
            .iter()
            .map(|domain| HealthProbe::Http {
                url: health_url(domain, None, "/health"),
                expected_status: 200,
                resolve_to: None,
                required: true,
            })
            .collect();

        let started = Instant::now();
        let report = verify(&h.state, &probes, Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!report.passed);
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().any(|r| r.error.as_deref() == Some("health budget exhausted")));
    }

    #[tokio::test]
    async fn test_staging_probes_resolve_to_staging_port() {
        let h = Harness::new().await;
        let env = h.state.registry.resolve(&h.pe()).unwrap();
        let probes = staging_probes(&h.state, &env, "rollout-staging-x");
        match &probes[0] {
            HealthProbe::Http { url, resolve_to, .. } => {
                assert_eq!(url, "https://example.com:8443/health");
                assert_eq!(resolve_to.unwrap().port(), 8443);
            }
            other => panic!("unexpected probe {:?}", other),
        }
    }
}
