//! 项目注册表
//!
//! 读取平台的 `projects.yml`（只读），解析出每个 (项目, 环境) 的域名、容器、数据库和备份策略

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::env::constants;
use crate::domain::database::{DatabaseType, DbConnectionConfig};
use crate::domain::deploy::{Environment, ProjectEnvironment};
use crate::error::{DeployError, DeployResult};

/// 某个 (项目, 环境) 的解析结果
#[derive(Clone, Debug)]
pub struct ProjectEnvConfig {
    pub project_env: ProjectEnvironment,
    pub domains: Vec<String>,
    /// 该环境在 conf.d 中拥有的配置文件
    pub config_files: Vec<String>,
    /// 镜像替换目标（compose 服务名 / 容器名）
    pub app_container: Option<String>,
    pub database: Option<DbConnectionConfig>,
    pub retention_days: u32,
    /// 恢复后立即做一次行数校验
    pub verify_on_restore: bool,
    pub health_path: String,
}

impl ProjectEnvConfig {
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }
}

/// 只读项目注册表
pub trait ProjectRegistry: Send + Sync {
    fn resolve(&self, project_env: &ProjectEnvironment) -> DeployResult<ProjectEnvConfig>;
    /// 所有已注册的 (项目, 环境)
    fn environments(&self) -> Vec<ProjectEnvironment>;
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: BTreeMap<String, ProjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ProjectEntry {
    #[serde(default)]
    domains: DomainsEntry,
    #[serde(default)]
    containers: BTreeMap<String, ContainerEntry>,
    /// 镜像替换目标，默认 backend 容器
    app_container: Option<String>,
    database: Option<DatabaseEntry>,
    #[serde(default)]
    backup: BackupEntry,
    #[serde(default)]
    health: HealthEntry,
}

#[derive(Debug, Default, Deserialize)]
struct DomainsEntry {
    #[serde(default)]
    production: Vec<String>,
    staging: Option<StagingDomains>,
}

/// staging 域名既可以写成列表，也可以写成 `{ domains: [...] }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StagingDomains {
    List(Vec<String>),
    Nested { domains: Vec<String> },
}

impl StagingDomains {
    fn as_slice(&self) -> &[String] {
        match self {
            StagingDomains::List(v) | StagingDomains::Nested { domains: v } => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainerEntry {
    name: String,
    #[allow(dead_code)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct DatabaseEntry {
    engine: DatabaseType,
    container: String,
    name: String,
    /// 默认 `<name>_staging`
    staging_name: Option<String>,
    username: Option<String>,
    /// 存放密码的环境变量名
    password_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupEntry {
    #[serde(default = "default_retention_days")]
    retention_days: u32,
    #[serde(default)]
    verify_on_restore: bool,
}

impl Default for BackupEntry {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            verify_on_restore: false,
        }
    }
}

fn default_retention_days() -> u32 {
    constants::DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(default = "default_health_path")]
    path: String,
}

impl Default for HealthEntry {
    fn default() -> Self {
        Self {
            path: default_health_path(),
        }
    }
}

fn default_health_path() -> String {
    "/".to_string()
}

/// 配置文件名：主域名去掉 `www.` 后加 `.conf`
pub fn config_file_name(primary_domain: &str) -> String {
    format!("{}.conf", primary_domain.trim_start_matches("www."))
}

fn is_valid_db_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 基于 `projects.yml` 的注册表
pub struct YamlProjectRegistry {
    projects: BTreeMap<String, ProjectEntry>,
}

impl YamlProjectRegistry {
    pub fn load(path: &Path) -> DeployResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> DeployResult<Self> {
        let file: RegistryFile = serde_yaml::from_str(content)
            .map_err(|e| DeployError::Config(format!("invalid projects file: {}", e)))?;

        for (name, project) in &file.projects {
            if let Some(db) = &project.database {
                let staging = db
                    .staging_name
                    .clone()
                    .unwrap_or_else(|| format!("{}_staging", db.name));
                for db_name in [&db.name, &staging] {
                    if !is_valid_db_name(db_name) {
                        return Err(DeployError::Config(format!(
                            "project {}: invalid database name '{}'",
                            name, db_name
                        )));
                    }
                }
            }
        }

        Ok(Self {
            projects: file.projects,
        })
    }
}

impl ProjectRegistry for YamlProjectRegistry {
    fn resolve(&self, project_env: &ProjectEnvironment) -> DeployResult<ProjectEnvConfig> {
        let entry = self
            .projects
            .get(&project_env.project)
            .ok_or_else(|| DeployError::NotFound(format!("project {}", project_env.project)))?;

        let staging = project_env.environment == Environment::Staging;
        let domains = if staging {
            entry
                .domains
                .staging
                .as_ref()
                .map(|s| s.as_slice().to_vec())
                .unwrap_or_default()
        } else {
            entry.domains.production.clone()
        };
        if domains.is_empty() {
            return Err(DeployError::NotFound(format!(
                "{} has no domains configured",
                project_env
            )));
        }

        // staging 容器统一加 -staging 后缀
        let with_suffix = |name: &str| {
            if staging {
                format!("{}-staging", name)
            } else {
                name.to_string()
            }
        };
        let app_container = entry
            .app_container
            .as_deref()
            .or_else(|| entry.containers.get("backend").map(|c| c.name.as_str()))
            .map(with_suffix);

        let database = entry.database.as_ref().map(|db| {
            let database = if staging {
                db.staging_name
                    .clone()
                    .unwrap_or_else(|| format!("{}_staging", db.name))
            } else {
                db.name.clone()
            };
            DbConnectionConfig {
                db_type: db.engine,
                container: db.container.clone(),
                database,
                username: db.username.clone(),
                password: db
                    .password_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok()),
            }
        });

        Ok(ProjectEnvConfig {
            project_env: project_env.clone(),
            config_files: vec![config_file_name(&domains[0])],
            domains,
            app_container,
            database,
            retention_days: entry.backup.retention_days,
            verify_on_restore: entry.backup.verify_on_restore,
            health_path: entry.health.path.clone(),
        })
    }

    fn environments(&self) -> Vec<ProjectEnvironment> {
        let mut result = Vec::new();
        for (name, entry) in &self.projects {
            if !entry.domains.production.is_empty() {
                result.push(ProjectEnvironment::new(name.clone(), Environment::Production));
            }
            if entry.domains.staging.is_some() {
                result.push(ProjectEnvironment::new(name.clone(), Environment::Staging));
            }
        }
        result
    }
}
