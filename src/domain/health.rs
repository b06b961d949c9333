//! 健康检查领域模型

use serde::Serialize;
use std::net::SocketAddr;

/// 健康探测目标
#[derive(Clone, Debug)]
pub enum HealthProbe {
    /// HTTP(S) 请求，期望特定状态码
    Http {
        url: String,
        expected_status: u16,
        /// 将 URL 中的主机名解析到指定地址（staging 端口）
        resolve_to: Option<SocketAddr>,
        required: bool,
    },
    /// 容器自身的健康状态
    Container { identity: String, required: bool },
}

impl HealthProbe {
    pub fn target(&self) -> String {
        match self {
            HealthProbe::Http { url, resolve_to, .. } => match resolve_to {
                Some(addr) => format!("{} (via {})", url, addr),
                None => url.clone(),
            },
            HealthProbe::Container { identity, .. } => format!("container:{}", identity),
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            HealthProbe::Http { required, .. } | HealthProbe::Container { required, .. } => {
                *required
            }
        }
    }
}

/// 单次探测结果
#[derive(Clone, Debug, Serialize)]
pub struct HealthCheckResult {
    pub target: String,
    pub expected_status: Option<u16>,
    pub observed_status: Option<u16>,
    pub latency_ms: u64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn failed(target: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            target: target.into(),
            expected_status: None,
            observed_status: None,
            latency_ms,
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// 一轮健康校验汇总
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub passed: bool,
    /// 每个探测最后一次尝试的结果
    pub results: Vec<HealthCheckResult>,
    /// 总尝试次数
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl HealthReport {
    /// 失败探测的简短描述
    pub fn failure_summary(&self) -> String {
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| match (&r.error, r.observed_status) {
                (Some(e), _) => format!("{}: {}", r.target, e),
                (None, Some(status)) => format!("{}: status {}", r.target, status),
                (None, None) => r.target.clone(),
            })
            .collect();
        if failed.is_empty() {
            "all probes passed".to_string()
        } else {
            failed.join("; ")
        }
    }
}
