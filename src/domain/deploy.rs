//! 部署相关领域模型
//!
//! 部署清单（manifest）是一次部署尝试的持久化记录，状态机见 [`ManifestStatus`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 环境
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Staging,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// (项目, 环境) 二元组，所有锁、清单和备份都以它为键
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectEnvironment {
    pub project: String,
    pub environment: Environment,
}

impl ProjectEnvironment {
    pub fn new(project: impl Into<String>, environment: Environment) -> Self {
        Self {
            project: project.into(),
            environment,
        }
    }

    /// 文件系统安全的键（用于锁文件名）
    pub fn key(&self) -> String {
        format!("{}__{}", self.project, self.environment)
    }
}

impl fmt::Display for ProjectEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.environment)
    }
}

impl FromStr for ProjectEnvironment {
    type Err = String;

    /// 解析 `project/environment`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (project, env) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <project>/<environment>, got '{}'", s))?;
        if project.is_empty()
            || !project
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("invalid project name '{}'", project));
        }
        Ok(Self::new(project, env.parse()?))
    }
}

/// 部署清单状态
///
/// pending → staged → promoted → healthy，失败分支为 failed / rolled_back
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    Staged,
    Promoted,
    Healthy,
    RolledBack,
    Failed,
}

impl ManifestStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::Staged => "staged",
            ManifestStatus::Promoted => "promoted",
            ManifestStatus::Healthy => "healthy",
            ManifestStatus::RolledBack => "rolled_back",
            ManifestStatus::Failed => "failed",
        }
    }

    /// 是否为终态（终态清单不可再修改）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ManifestStatus::Healthy | ManifestStatus::RolledBack | ManifestStatus::Failed
        )
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: ManifestStatus) -> bool {
        use ManifestStatus::*;
        matches!(
            (self, next),
            (Pending, Staged)
                | (Pending, Failed)
                | (Staged, Promoted)
                | (Staged, Failed)
                | (Promoted, Healthy)
                | (Promoted, RolledBack)
                | (Promoted, Failed)
        )
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非法状态迁移
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid manifest transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ManifestStatus,
    pub to: ManifestStatus,
}

/// 状态迁移记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: ManifestStatus,
    pub at: DateTime<Utc>,
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

pub const STAGE_STAGING: &str = "staging";
pub const STAGE_APPROVAL: &str = "approval";
pub const STAGE_BACKUP: &str = "backup";
pub const STAGE_SWITCH: &str = "switch";
pub const STAGE_HEALTH: &str = "health";
pub const STAGE_ROLLBACK: &str = "rollback";

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "validate", "staging", "backup")
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 失败详情
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureDetail {
    /// 错误分类 (e.g., "validation_failed", "restore_failed")
    pub kind: String,
    pub message: String,
    /// 需要人工介入（回滚本身失败）
    #[serde(default)]
    pub requires_manual_intervention: bool,
}

/// 部署清单
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub manifest_id: String,
    pub project: String,
    pub environment: Environment,
    pub candidate_checksum: String,
    /// 部署前备份（promote 之前必须存在）
    pub backup_id: Option<String>,
    /// 候选镜像
    pub image: Option<String>,
    /// 部署前运行中的镜像
    pub previous_image: Option<String>,
    pub status: ManifestStatus,
    pub transitions: Vec<StatusTransition>,
    #[serde(default)]
    pub stages: Vec<DeployStage>,
    /// 部署后健康检查结果
    pub health_passed: Option<bool>,
    pub failure: Option<FailureDetail>,
}

impl DeploymentManifest {
    /// 创建 pending 状态的新清单
    pub fn new(
        project_env: &ProjectEnvironment,
        candidate_checksum: impl Into<String>,
        image: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            manifest_id: timestamp_id("deploy", now),
            project: project_env.project.clone(),
            environment: project_env.environment,
            candidate_checksum: candidate_checksum.into(),
            backup_id: None,
            image,
            previous_image: None,
            status: ManifestStatus::Pending,
            transitions: vec![StatusTransition {
                status: ManifestStatus::Pending,
                at: now,
            }],
            stages: Vec::new(),
            health_passed: None,
            failure: None,
        }
    }

    pub fn project_env(&self) -> ProjectEnvironment {
        ProjectEnvironment::new(self.project.clone(), self.environment)
    }

    /// 执行状态迁移
    pub fn transition(&mut self, next: ManifestStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.transitions.push(StatusTransition {
            status: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// 迁移到 failed 并记录原因
    pub fn fail(
        &mut self,
        kind: &str,
        message: impl Into<String>,
        requires_manual_intervention: bool,
    ) -> Result<(), InvalidTransition> {
        self.transition(ManifestStatus::Failed)?;
        self.failure = Some(FailureDetail {
            kind: kind.to_string(),
            message: message.into(),
            requires_manual_intervention,
        });
        Ok(())
    }

    /// 结束阶段轨迹中的某个阶段；终态迁移之前调用，终态清单不再改写
    pub fn finish_stage(&mut self, name: &str, success: bool, message: Option<String>) {
        if let Some(stage) = self.stages.iter_mut().find(|s| s.name == name) {
            stage.finish(success, message);
        }
    }

    /// 进入某状态的时间
    pub fn entered_at(&self, status: ManifestStatus) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.status == status)
            .map(|t| t.at)
    }

    /// 每个状态的时间戳
    pub fn timestamps(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.transitions
            .iter()
            .map(|t| (t.status.as_str().to_string(), t.at))
            .collect()
    }

    /// `status` 命令输出的摘要
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            manifest_id: self.manifest_id.clone(),
            status: self.status,
            backup_id: self.backup_id.clone(),
            timestamps: self.timestamps(),
        }
    }
}

/// 清单摘要
#[derive(Clone, Debug, Serialize)]
pub struct ManifestSummary {
    pub manifest_id: String,
    pub status: ManifestStatus,
    pub backup_id: Option<String>,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
}

/// 生成按字典序即时间序排列的 ID，如 `deploy_20250106_143000_123`
pub fn timestamp_id(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, at.format("%Y%m%d_%H%M%S_%3f"))
}
