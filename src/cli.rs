//! 命令行入口
//!
//! 每个子命令在 stdout 输出一份 JSON 报告，在 stderr 输出一行人类可读的摘要

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::config::env::constants::{DEFAULT_VERIFY_SAMPLE, PROXY_LOCK_KEY};
use crate::config::env::EnvConfig;
use crate::domain::deploy::ProjectEnvironment;
use crate::error::{exit_code, DeployError, DeployResult};
use crate::services::deploy::{self, DeployRequest};
use crate::services::gate::OperatorIntent;
use crate::services::{backup, validator, verifier};
use crate::state::AppState;

/// 平台共享 nginx / 数据库的分阶段部署与备份工具
#[derive(Parser, Debug)]
#[command(name = "xjp-rollout", version, about = "Staged deployment and backup orchestrator")]
pub struct Cli {
    /// 状态目录（清单、锁）
    #[arg(long, value_name = "DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// 备份目录
    #[arg(long, value_name = "DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// 项目注册表 projects.yml
    #[arg(long, value_name = "FILE", global = true)]
    pub projects: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// 命令行参数覆盖环境变量配置
    pub fn apply_overrides(&self, config: &mut EnvConfig) {
        if let Some(ref dir) = self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(ref dir) = self.backup_dir {
            config.backup_dir = dir.clone();
        }
        if let Some(ref file) = self.projects {
            config.projects_file = file.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 校验 → staging → 备份 → 切换 → 健康检查
    Deploy {
        /// <project>/<environment>
        target: ProjectEnvironment,
        /// 渲染好的候选配置目录（*.conf）
        #[arg(long, value_name = "DIR")]
        candidate: PathBuf,
        /// 新的应用镜像
        #[arg(long, value_name = "REF")]
        image: Option<String>,
        /// staging 通过后直接上线
        #[arg(long, conflicts_with = "confirm")]
        force: bool,
        /// 确认上线已 staged 的候选
        #[arg(long)]
        confirm: bool,
    },
    /// 创建备份，输出备份 ID
    Backup { target: ProjectEnvironment },
    /// 从备份恢复（ID 或前缀，多个匹配取最新）
    Restore {
        target: ProjectEnvironment,
        backup: String,
        /// 备份所在的 (项目, 环境)，默认与目标相同
        #[arg(long, value_name = "PROJECT/ENV")]
        from: Option<ProjectEnvironment>,
    },
    /// 抽样校验近期备份
    VerifyBackups {
        target: Option<ProjectEnvironment>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = DEFAULT_VERIFY_SAMPLE)]
        sample: usize,
    },
    /// 最新清单
    Status { target: ProjectEnvironment },
    /// 对中断的 promoted 清单重新做健康检查
    Resume { target: ProjectEnvironment },
    /// 回滚最新的 promoted 清单
    Rollback { target: ProjectEnvironment },
    /// 删除过期备份
    Sweep {
        target: ProjectEnvironment,
        #[arg(long)]
        dry_run: bool,
    },
    ListBackups { target: ProjectEnvironment },
    History { target: ProjectEnvironment },
}

/// 失败时退出码的取法
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitPolicy {
    /// 部署流水线：每类失败一个退出码
    FailureClasses,
    /// 其余命令：成功 0，失败 1
    Binary,
}

impl ExitPolicy {
    pub fn code_for(self, err: &DeployError) -> i32 {
        match self {
            ExitPolicy::FailureClasses => err.exit_code(),
            ExitPolicy::Binary => exit_code::GENERIC,
        }
    }
}

impl Command {
    pub fn exit_policy(&self) -> ExitPolicy {
        match self {
            Command::Deploy { .. } | Command::Resume { .. } | Command::Rollback { .. } => {
                ExitPolicy::FailureClasses
            }
            _ => ExitPolicy::Binary,
        }
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandOutput {
    pub report: serde_json::Value,
    pub summary: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok<T: Serialize>(report: &T, summary: impl Into<String>) -> DeployResult<Self> {
        Ok(Self {
            report: serde_json::to_value(report)?,
            summary: summary.into(),
            exit_code: exit_code::OK,
        })
    }
}

/// 执行子命令
pub async fn run(state: &AppState, command: Command) -> DeployResult<CommandOutput> {
    match command {
        Command::Deploy {
            target,
            candidate,
            image,
            force,
            confirm,
        } => {
            let intent = match (force, confirm) {
                (true, _) => OperatorIntent::Force,
                (false, true) => OperatorIntent::Confirm,
                (false, false) => OperatorIntent::None,
            };
            let candidate = validator::load_candidate(&candidate, image).await?;
            let outcome = deploy::deploy(
                state,
                DeployRequest {
                    project_env: target.clone(),
                    candidate,
                    intent,
                },
            )
            .await?;
            let summary = format!(
                "{} deployed: manifest {} is {}",
                target, outcome.manifest.manifest_id, outcome.manifest.status
            );
            CommandOutput::ok(&outcome, summary)
        }

        Command::Backup { target } => {
            let _lock = state.locks.acquire(&target.key(), "backup")?;
            let env = state.registry.resolve(&target)?;
            let created = backup::backup(state, &env, &[]).await?;
            CommandOutput::ok(&created, created.id.clone())
        }

        Command::Restore { target, backup: id, from } => {
            let _lock = state.locks.acquire(&target.key(), "restore")?;
            let env = state.registry.resolve(&target)?;
            let source = from.unwrap_or_else(|| target.clone());
            let selected = state.backups.resolve(&source, &id).await?;
            let _proxy_lock = state.locks.acquire(PROXY_LOCK_KEY, &format!("restore {}", target))?;
            info!(project_env = %target, backup_id = %selected.id, "Restoring backup");
            let report = backup::restore(state, &env, &selected).await?;
            let summary = format!("{} restored from {}", target, report.backup_id);
            CommandOutput::ok(&report, summary)
        }

        Command::VerifyBackups {
            target,
            dry_run,
            sample,
        } => {
            let run = verifier::verify_backups(state, target.as_ref(), sample, dry_run).await?;
            let summary = if dry_run {
                format!("{} backup(s) selected for verification", run.selected.len())
            } else {
                format!(
                    "{} backup(s) verified, {} suspect",
                    run.outcomes.len(),
                    run.suspect
                )
            };
            let mut output = CommandOutput::ok(&run, summary)?;
            if run.suspect > 0 {
                output.exit_code = exit_code::GENERIC;
            }
            Ok(output)
        }

        Command::Status { target } => {
            let summary = deploy::status(state, &target).await?;
            let line = format!("{}: {} is {}", target, summary.manifest_id, summary.status);
            CommandOutput::ok(&summary, line)
        }

        Command::Resume { target } => {
            let outcome = deploy::resume(state, &target).await?;
            let summary = format!("{}: {} is {}", target, outcome.manifest.manifest_id, outcome.manifest.status);
            CommandOutput::ok(&outcome, summary)
        }

        Command::Rollback { target } => {
            let report = deploy::rollback_latest(state, &target).await?;
            let summary = format!(
                "{}: {} rolled back to {}",
                target, report.manifest_id, report.backup_id
            );
            CommandOutput::ok(&report, summary)
        }

        Command::Sweep { target, dry_run } => {
            let _lock = state.locks.acquire(&target.key(), "sweep")?;
            let report = backup::sweep(state, &target, dry_run).await?;
            let verb = if dry_run { "would delete" } else { "deleted" };
            let summary = format!(
                "{}: {} {} backup(s), {} retention conflict(s)",
                target,
                verb,
                report.deleted.len(),
                report.conflicts.len()
            );
            CommandOutput::ok(&report, summary)
        }

        Command::ListBackups { target } => {
            let backups = state.backups.list(&target).await?;
            let summary = format!("{}: {} backup(s)", target, backups.len());
            CommandOutput::ok(&backups, summary)
        }

        Command::History { target } => {
            let history = deploy::history(state, &target).await?;
            let summary = format!("{}: {} deployment(s)", target, history.len());
            CommandOutput::ok(&history, summary)
        }
    }
}
