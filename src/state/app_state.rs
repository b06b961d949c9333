//! 应用状态
//!
//! 一次命令调用所需的全部依赖：配置、注册表、外部协作方、持久化存储和取消令牌

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::config::project::{ProjectRegistry, YamlProjectRegistry};
use crate::error::DeployResult;
use crate::infra::{
    CertificateAuthority, ContainerRuntime, DatabaseTool, DockerDatabaseTool, DockerRuntime,
    HttpProber, LocalCertificateStore, ReqwestProber,
};

use super::backup_store::BackupStore;
use super::lock::LockManager;
use super::manifest_store::ManifestStore;

/// 外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub database: Arc<dyn DatabaseTool>,
    pub certs: Arc<dyn CertificateAuthority>,
    pub prober: Arc<dyn HttpProber>,
}

impl Collaborators {
    /// docker / openssl / reqwest 实现
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            runtime: Arc::new(DockerRuntime::new(
                &config.proxy.reload_command,
                config.compose_file.clone(),
                config.timeouts.command,
            )),
            database: Arc::new(DockerDatabaseTool::new(config.timeouts.database)),
            certs: Arc::new(LocalCertificateStore::new(
                config.cert_dir.clone(),
                config.timeouts.command,
            )),
            prober: Arc::new(ReqwestProber::new()),
        }
    }
}

/// 应用状态
pub struct AppState {
    // ========== 配置 ==========
    pub config: EnvConfig,
    /// 项目注册表（只读）
    pub registry: Arc<dyn ProjectRegistry>,

    // ========== 外部协作方 ==========
    pub runtime: Arc<dyn ContainerRuntime>,
    pub database: Arc<dyn DatabaseTool>,
    pub certs: Arc<dyn CertificateAuthority>,
    pub prober: Arc<dyn HttpProber>,

    // ========== 持久化状态 ==========
    pub manifests: ManifestStore,
    pub backups: BackupStore,
    pub locks: LockManager,

    /// Ctrl-C / SIGTERM 时取消
    pub cancel: CancellationToken,
}

impl AppState {
    /// 用真实协作方创建，注册表从 `projects_file` 加载
    pub fn new(config: EnvConfig, cancel: CancellationToken) -> DeployResult<Self> {
        let registry = YamlProjectRegistry::load(&config.projects_file)?;
        let collaborators = Collaborators::from_config(&config);

        tracing::info!(
            projects_file = %config.projects_file.display(),
            state_dir = %config.state_dir.display(),
            backup_dir = %config.backup_dir.display(),
            proxy = %config.proxy.container,
            "Rollout state initialized"
        );

        Ok(Self::with_collaborators(
            config,
            Arc::new(registry),
            collaborators,
            cancel,
        ))
    }

    pub fn with_collaborators(
        config: EnvConfig,
        registry: Arc<dyn ProjectRegistry>,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let manifests = ManifestStore::new(config.manifests_dir());
        let backups = BackupStore::new(config.backup_dir.clone());
        let locks = LockManager::new(config.locks_dir(), config.timeouts.lock_stale_after());

        Self {
            registry,
            runtime: collaborators.runtime,
            database: collaborators.database,
            certs: collaborators.certs,
            prober: collaborators.prober,
            manifests,
            backups,
            locks,
            cancel,
            config,
        }
    }
}
