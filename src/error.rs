//! 统一错误处理
//!
//! `DeployError` 是编排层的错误分类，每个变体对应一个稳定的 `kind()` 和进程退出码；
//! `ErrorResponse` 是失败时输出到 stdout 的 JSON 结构

use serde::Serialize;

use crate::domain::deploy::InvalidTransition;
use crate::domain::proxy_config::Violation;
use crate::domain::health::HealthCheckResult;
use crate::infra::ToolError;

/// 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// 进程退出码
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const VALIDATION_FAILED: i32 = 10;
    pub const STAGING_FAILED: i32 = 11;
    pub const AWAITING_APPROVAL: i32 = 12;
    pub const BUSY: i32 = 13;
    pub const BACKUP_FAILED: i32 = 14;
    pub const SWITCH_FAILED: i32 = 15;
    /// 健康检查失败且已回滚
    pub const HEALTH_FAILED: i32 = 16;
    /// 回滚失败，需要人工介入
    pub const RESTORE_FAILED: i32 = 17;
    /// 健康检查失败但回滚没有开始，生产仍是新版本
    pub const HEALTH_FAILED_NOT_ROLLED_BACK: i32 = 18;
}

/// 编排错误
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("candidate violates {} platform invariant(s)", .0.len())]
    ValidationFailed(Vec<Violation>),

    #[error("staging failed: {message}")]
    StagingFailed {
        message: String,
        results: Vec<HealthCheckResult>,
    },

    /// 候选已通过 staging，等待 `--confirm`
    #[error("manifest {manifest_id} is staged and awaiting approval")]
    AwaitingApproval { manifest_id: String },

    #[error("{key} is locked by {holder}")]
    Busy { key: String, holder: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("production switch failed: {0}")]
    SwitchFailed(String),

    #[error("health check failed for {manifest_id}: {summary}")]
    HealthCheckFailed {
        manifest_id: String,
        summary: String,
        rolled_back: bool,
    },

    /// 需要人工介入
    #[error("restore failed: {message}")]
    RestoreFailed {
        message: String,
        diagnostic: Option<String>,
    },

    #[error("restore refused: database {database} has {connections} active connection(s)")]
    RestoreRefused { database: String, connections: u64 },

    #[error("backup {backup} belongs to {source_env}, cannot restore into {target}")]
    CrossEnvironmentRestore {
        backup: String,
        source_env: String,
        target: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl DeployError {
    /// 机器可读的错误分类
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::ValidationFailed(_) => "validation_failed",
            DeployError::StagingFailed { .. } => "staging_failed",
            DeployError::AwaitingApproval { .. } => "awaiting_approval",
            DeployError::Busy { .. } => "busy",
            DeployError::BackupFailed(_) => "backup_failed",
            DeployError::SwitchFailed(_) => "switch_failed",
            DeployError::HealthCheckFailed { .. } => "health_check_failed",
            DeployError::RestoreFailed { .. } => "restore_failed",
            DeployError::RestoreRefused { .. } => "restore_refused",
            DeployError::CrossEnvironmentRestore { .. } => "cross_environment_restore",
            DeployError::NotFound(_) => "not_found",
            DeployError::Config(_) => "config_error",
            DeployError::InvalidTransition(_) => "invalid_transition",
            DeployError::Tool(_) => "tool_error",
            DeployError::Io(_) => "io_error",
            DeployError::Serde(_) => "serialization_error",
            DeployError::Cancelled => "cancelled",
        }
    }

    /// 部署流水线按失败类别区分的退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::ValidationFailed(_) => exit_code::VALIDATION_FAILED,
            DeployError::StagingFailed { .. } => exit_code::STAGING_FAILED,
            DeployError::AwaitingApproval { .. } => exit_code::AWAITING_APPROVAL,
            DeployError::Busy { .. } => exit_code::BUSY,
            DeployError::BackupFailed(_) => exit_code::BACKUP_FAILED,
            DeployError::SwitchFailed(_) => exit_code::SWITCH_FAILED,
            DeployError::HealthCheckFailed { rolled_back: true, .. } => exit_code::HEALTH_FAILED,
            DeployError::HealthCheckFailed { rolled_back: false, .. } => {
                exit_code::HEALTH_FAILED_NOT_ROLLED_BACK
            }
            DeployError::RestoreFailed { .. } => exit_code::RESTORE_FAILED,
            DeployError::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERIC,
        }
    }

    /// 转换为 JSON 错误响应
    pub fn to_response(&self) -> ErrorResponse {
        let response = ErrorResponse::new(self.kind(), self.to_string());
        let details = match self {
            DeployError::ValidationFailed(violations) => serde_json::to_value(violations).ok(),
            DeployError::StagingFailed { results, .. } if !results.is_empty() => {
                serde_json::to_value(results).ok()
            }
            DeployError::AwaitingApproval { manifest_id } => {
                Some(serde_json::json!({ "manifest_id": manifest_id, "next": "deploy --confirm" }))
            }
            DeployError::HealthCheckFailed {
                manifest_id,
                rolled_back: true,
                ..
            } => Some(serde_json::json!({ "manifest_id": manifest_id, "rolled_back": true })),
            DeployError::HealthCheckFailed { manifest_id, .. } => Some(serde_json::json!({
                "manifest_id": manifest_id,
                "rolled_back": false,
                "next": "rollback",
            })),
            DeployError::RestoreFailed { diagnostic, .. } => Some(serde_json::json!({
                "requires_manual_intervention": true,
                "diagnostic": diagnostic,
            })),
            DeployError::Tool(e) => Some(serde_json::Value::String(e.diagnostic())),
            _ => None,
        };
        match details {
            Some(details) => response.with_details(details),
            None => response,
        }
    }
}

/// 便捷类型别名
pub type DeployResult<T> = Result<T, DeployError>;
