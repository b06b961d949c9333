//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio 和外部进程

pub mod backup;
pub mod database;
pub mod deploy;
pub mod health;
pub mod proxy_config;

// Re-exports for convenience
pub use backup::{Backup, ConfigSnapshot, DatabaseArtifact, VerificationStatus};
pub use database::{DatabaseType, DbConnectionConfig, TableStats};
pub use deploy::{
    DeployStage, DeploymentManifest, Environment, ManifestStatus, ManifestSummary,
    ProjectEnvironment, StageStatus,
};
pub use health::{HealthCheckResult, HealthProbe, HealthReport};
pub use proxy_config::{CandidateConfig, Violation, ViolationRule};
