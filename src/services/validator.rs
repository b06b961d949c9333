//! 配置校验
//!
//! 校验对象是「线上 conf.d 叠加候选文件」后的完整配置集合：
//! 1. 整个集合中恰好一个 `listen ... reuseport`
//! 2. 每个对外虚拟主机都有 `listen ... quic`
//! 3. 证书文件存在，且证书协作方确认主域名证书有效
//! 4. 在一次性容器中执行 `nginx -t`（只读挂载，从不接触线上实例）

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::domain::proxy_config::{self, CandidateConfig, ParsedConfig, Violation, ViolationRule};
use crate::error::{DeployError, DeployResult};
use crate::infra::{InstanceSpec, Mount};
use crate::state::AppState;

/// 校验报告
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub files: Vec<String>,
    pub reuseport_locations: Vec<String>,
    pub violations: Vec<Violation>,
    /// `nginx -t` 输出（静态检查失败时不执行）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_test: Option<String>,
}

impl ValidationReport {
    pub fn into_result(self) -> DeployResult<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(DeployError::ValidationFailed(self.violations))
        }
    }
}

/// 线上配置叠加候选后的完整集合
#[derive(Clone, Debug)]
pub struct AssembledConfig {
    pub files: BTreeMap<String, String>,
}

impl AssembledConfig {
    /// 写入临时目录（供配置测试和 staging 只读挂载）
    pub async fn materialize(&self) -> DeployResult<TempDir> {
        let dir = tempfile::Builder::new().prefix("rollout-conf-").tempdir()?;
        for (name, content) in &self.files {
            fs::write(dir.path().join(name), content).await?;
        }
        Ok(dir)
    }
}

/// 从渲染输出目录加载候选配置（`*.conf`）
pub async fn load_candidate(dir: &Path, image: Option<String>) -> DeployResult<CandidateConfig> {
    let files = read_conf_dir(dir).await.map_err(|e| {
        DeployError::Config(format!("cannot read candidate dir {}: {}", dir.display(), e))
    })?;
    if files.is_empty() {
        return Err(DeployError::Config(format!(
            "candidate dir {} contains no .conf files",
            dir.display()
        )));
    }
    Ok(CandidateConfig::new(files, image))
}

/// 读取目录下的 `*.conf`（不递归）
pub async fn read_conf_dir(dir: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") || !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            files.insert(name.to_string(), fs::read_to_string(&path).await?);
        }
    }
    Ok(files)
}

/// 组装完整配置集合
pub async fn assemble(state: &AppState, candidate: &CandidateConfig) -> DeployResult<AssembledConfig> {
    let mut files = read_conf_dir(&state.config.live_conf_dir).await?;
    for (name, content) in &candidate.files {
        files.insert(name.clone(), content.clone());
    }
    Ok(AssembledConfig { files })
}

/// 结构性检查：reuseport 数量与 HTTP/3 监听
pub fn check_structure(parsed: &[ParsedConfig]) -> (Vec<String>, Vec<Violation>) {
    let mut violations = Vec::new();

    let reuseport: Vec<String> = parsed.iter().flat_map(|p| p.reuseport_locations()).collect();
    if reuseport.len() != 1 {
        violations.push(Violation::new(
            ViolationRule::ReuseportCount,
            None,
            format!(
                "expected exactly 1 listen directive with reuseport, found {}{}",
                reuseport.len(),
                if reuseport.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", reuseport.join(", "))
                }
            ),
        ));
    }

    for server in parsed.iter().flat_map(|p| p.servers.iter()) {
        if server.is_public() && !server.has_http3() {
            violations.push(Violation::new(
                ViolationRule::MissingHttp3,
                Some(server.location()),
                format!(
                    "public vhost {} has no 'listen ... quic' listener",
                    server.primary_domain().unwrap_or("?")
                ),
            ));
        }
    }

    (reuseport, violations)
}

/// 证书检查
async fn check_certificates(state: &AppState, parsed: &[ParsedConfig]) -> DeployResult<Vec<Violation>> {
    let mut violations = Vec::new();
    let mut checked_domains = BTreeMap::new();

    for server in parsed.iter().flat_map(|p| p.servers.iter()) {
        for (line, path) in server.certificate_paths() {
            let host_path = state.config.host_cert_path(path);
            if !fs::try_exists(&host_path).await.unwrap_or(false) {
                violations.push(Violation::new(
                    ViolationRule::MissingCertificate,
                    Some(format!("{}:{}", server.file, line)),
                    format!("certificate file {} does not exist", path),
                ));
            }
        }

        if !server.is_public() {
            continue;
        }
        let Some(domain) = server.primary_domain() else {
            continue;
        };
        let valid = match checked_domains.get(domain) {
            Some(valid) => *valid,
            None => {
                let valid = state.certs.cert_exists_and_valid(domain).await?;
                checked_domains.insert(domain.to_string(), valid);
                valid
            }
        };
        if !valid {
            violations.push(Violation::new(
                ViolationRule::InvalidCertificate,
                Some(server.location()),
                format!("certificate for {} is missing or expired", domain),
            ));
        }
    }
    Ok(violations)
}

/// 一次性配置测试实例
pub fn config_test_spec(state: &AppState, conf_dir: &Path) -> InstanceSpec {
    let proxy = &state.config.proxy;
    InstanceSpec {
        identity: format!(
            "rollout-configtest-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ),
        image: proxy.image.clone(),
        mounts: vec![
            Mount::read_only(conf_dir, proxy.conf_mount.clone()),
            Mount::read_only(state.config.cert_dir.clone(), state.config.cert_mount.clone()),
        ],
        ports: Vec::new(),
        network: proxy.network.clone(),
        command: proxy.test_command.split_whitespace().map(String::from).collect(),
    }
}

/// 校验候选配置，无副作用
pub async fn validate(state: &AppState, candidate: &CandidateConfig) -> DeployResult<ValidationReport> {
    let assembled = assemble(state, candidate).await?;
    let files: Vec<String> = assembled.files.keys().cloned().collect();
    debug!(files = ?files, checksum = %candidate.checksum, "Validating assembled config set");

    let mut violations = Vec::new();
    let mut parsed = Vec::new();
    for (name, content) in &assembled.files {
        match proxy_config::parse(name, content) {
            Ok(p) => parsed.push(p),
            Err(e) => violations.push(Violation::new(
                ViolationRule::Syntax,
                Some(format!("{}:{}", e.file, e.line)),
                e.message,
            )),
        }
    }

    let (reuseport_locations, structural) = check_structure(&parsed);
    violations.extend(structural);
    violations.extend(check_certificates(state, &parsed).await?);

    let mut config_test = None;
    if violations.is_empty() {
        let dir = assembled.materialize().await?;
        let spec = config_test_spec(state, dir.path());
        let outcome = state.runtime.test_config(&spec).await?;
        if !outcome.passed {
            violations.push(Violation::new(
                ViolationRule::ConfigTest,
                None,
                outcome.output.clone(),
            ));
        }
        config_test = Some(outcome.output);
    }

    let passed = violations.is_empty();
    if passed {
        info!(files = files.len(), "Candidate config passed validation");
    } else {
        for v in &violations {
            warn!(violation = %v, "Validation violation");
        }
    }

    Ok(ValidationReport {
        passed,
        files,
        reuseport_locations,
        violations,
        config_test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{site_conf, Harness};
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_valid_candidate_passes() {
        let h = Harness::new().await;
        let candidate = h.candidate(&[("example.com.conf", site_conf("example.com", true, true))]);

        let report = validate(&h.state, &candidate).await.unwrap();
        assert!(report.passed, "{:?}", report.violations);
        assert_eq!(report.reuseport_locations.len(), 1);
        assert!(report.config_test.is_some());
        assert_eq!(h.runtime.state.lock().unwrap().config_tests, 1);
    }

    #[tokio::test]
    async fn test_second_reuseport_fails_without_config_test() {
        let h = Harness::new().await;
        // 线上 example.com.conf 已有 reuseport，新文件再加一个
        let candidate = h.candidate(&[("other.example.com.conf", site_conf("other.example.com", true, true))]);

        let report = validate(&h.state, &candidate).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.violations[0].rule, ViolationRule::ReuseportCount);
        assert_eq!(report.reuseport_locations.len(), 2);
        assert!(report.config_test.is_none());
        assert_eq!(h.runtime.state.lock().unwrap().config_tests, 0);
        assert!(matches!(report.into_result(), Err(DeployError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_public_vhost_without_http3_fails() {
        let h = Harness::new().await;
        let candidate = h.candidate(&[("example.com.conf", site_conf("example.com", false, false))]);

        let report = validate(&h.state, &candidate).await.unwrap();
        let rules: Vec<ViolationRule> = report.violations.iter().map(|v| v.rule).collect();
        assert!(rules.contains(&ViolationRule::MissingHttp3));
        assert!(rules.contains(&ViolationRule::ReuseportCount));
    }

    #[tokio::test]
    async fn test_certificate_checks() {
        let h = Harness::new().await;
        h.certs.invalid.lock().unwrap().insert("example.com".to_string());
        let candidate = h.candidate(&[
            ("example.com.conf", site_conf("example.com", true, true)),
            ("nocert.example.com.conf", site_conf("nocert.example.com", false, true)),
        ]);

        let report = validate(&h.state, &candidate).await.unwrap();
        let rules: Vec<ViolationRule> = report.violations.iter().map(|v| v.rule).collect();
        assert!(rules.contains(&ViolationRule::InvalidCertificate));
        // nocert.example.com 的证书文件不存在
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == ViolationRule::MissingCertificate
                && v.location.as_deref().unwrap_or("").starts_with("nocert.example.com.conf:")));
    }

    #[tokio::test]
    async fn test_config_test_failure_is_a_violation() {
        let h = Harness::new().await;
        h.runtime.state.lock().unwrap().config_test_fails = true;
        let candidate = h.candidate(&[("example.com.conf", site_conf("example.com", true, true))]);

        let report = validate(&h.state, &candidate).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.violations[0].rule, ViolationRule::ConfigTest);
        assert!(report.violations[0].message.contains("unknown directive"));
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported_with_location() {
        let h = Harness::new().await;
        let candidate = h.candidate(&[("broken.conf", "server {\n listen 80\n".to_string())]);

        let report = validate(&h.state, &candidate).await.unwrap();
        assert_eq!(report.violations[0].rule, ViolationRule::Syntax);
        assert!(report.violations[0].location.as_deref().unwrap().starts_with("broken.conf:"));
    }

    #[tokio::test]
    async fn test_load_candidate_reads_only_conf_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.conf"), "server {}").await.unwrap();
        fs::write(dir.path().join("README.md"), "ignored").await.unwrap();

        let candidate = load_candidate(dir.path(), None).await.unwrap();
        assert_eq!(candidate.file_names(), vec!["a.conf".to_string()]);

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_candidate(empty.path(), None).await,
            Err(DeployError::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_reuseport_count_must_be_exactly_one(flags in proptest::collection::vec(any::<bool>(), 0..6)) {
            let parsed: Vec<ParsedConfig> = flags
                .iter()
                .enumerate()
                .map(|(i, reuse)| {
                    let domain = format!("site{}.example.com", i);
                    proxy_config::parse(&format!("{}.conf", domain), &site_conf(&domain, *reuse, true)).unwrap()
                })
                .collect();
            let count = flags.iter().filter(|f| **f).count();
            let (locations, violations) = check_structure(&parsed);
            prop_assert_eq!(locations.len(), count);
            let failed = violations.iter().any(|v| v.rule == ViolationRule::ReuseportCount);
            prop_assert_eq!(failed, count != 1);
        }
    }
}
