//! 备份存储
//!
//! 目录结构：
//! ```text
//! <backup_dir>/<project>/<env>/
//!     config/<id>/          配置快照
//!     database/<id>.dump    数据库 dump（MySQL 为 .sql.gz）
//!     meta/<id>.json        元数据（最后写入，存在即代表备份完整）
//! ```

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::write_json_atomic;
use crate::domain::backup::Backup;
use crate::domain::deploy::ProjectEnvironment;
use crate::error::{DeployError, DeployResult};

/// 备份存储
#[derive(Clone, Debug)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, project_env: &ProjectEnvironment) -> PathBuf {
        self.root
            .join(&project_env.project)
            .join(project_env.environment.as_str())
    }

    pub fn config_dir(&self, project_env: &ProjectEnvironment, id: &str) -> PathBuf {
        self.env_dir(project_env).join("config").join(id)
    }

    pub fn database_dir(&self, project_env: &ProjectEnvironment) -> PathBuf {
        self.env_dir(project_env).join("database")
    }

    fn meta_path(&self, project_env: &ProjectEnvironment, id: &str) -> PathBuf {
        self.env_dir(project_env).join("meta").join(format!("{}.json", id))
    }

    /// 数据库 dump 的绝对路径
    pub fn database_path(&self, backup: &Backup) -> Option<PathBuf> {
        backup
            .database
            .as_ref()
            .map(|db| self.database_dir(&backup.project_env()).join(&db.file))
    }

    /// 写入（或更新校验状态后重写）元数据
    pub async fn save(&self, backup: &Backup) -> DeployResult<()> {
        write_json_atomic(&self.meta_path(&backup.project_env(), &backup.id), backup).await?;
        Ok(())
    }

    /// 按 ID 升序列出
    pub async fn list(&self, project_env: &ProjectEnvironment) -> DeployResult<Vec<Backup>> {
        let dir = self.env_dir(project_env).join("meta");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Backup>(&content) {
                    Ok(backup) => backups.push(backup),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to parse backup metadata"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read backup metadata"),
            }
        }
        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    pub async fn latest(&self, project_env: &ProjectEnvironment) -> DeployResult<Option<Backup>> {
        Ok(self.list(project_env).await?.pop())
    }

    pub async fn get(&self, project_env: &ProjectEnvironment, id: &str) -> DeployResult<Backup> {
        let path = self.meta_path(project_env, id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::NotFound(format!("backup {} for {}", id, project_env)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// 按完整 ID 或前缀查找，前缀匹配多个时取最新
    pub async fn resolve(&self, project_env: &ProjectEnvironment, id_or_prefix: &str) -> DeployResult<Backup> {
        self.list(project_env)
            .await?
            .into_iter()
            .rev()
            .find(|b| b.id == id_or_prefix || b.id.starts_with(id_or_prefix))
            .ok_or_else(|| {
                DeployError::NotFound(format!("backup matching '{}' for {}", id_or_prefix, project_env))
            })
    }

    /// 删除备份的全部产物（元数据先删，避免留下看似完整的半个备份）
    pub async fn delete(&self, backup: &Backup) -> DeployResult<()> {
        let project_env = backup.project_env();
        remove_if_exists(&self.meta_path(&project_env, &backup.id)).await?;
        if let Some(db_path) = self.database_path(backup) {
            remove_if_exists(&db_path).await?;
        }
        let config_dir = self.config_dir(&project_env, &backup.id);
        match fs::remove_dir_all(&config_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(backup_id = %backup.id, project_env = %project_env, "Backup deleted");
        Ok(())
    }

    /// 删除未写完元数据的残留产物
    pub async fn discard_partial(&self, project_env: &ProjectEnvironment, id: &str, db_file: Option<&str>) {
        if let Some(file) = db_file {
            let _ = remove_if_exists(&self.database_dir(project_env).join(file)).await;
        }
        let _ = fs::remove_dir_all(self.config_dir(project_env, id)).await;
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backup::{retention_deadline, ConfigSnapshot, VerificationStatus};
    use crate::domain::deploy::Environment;
    use chrono::{TimeZone, Utc};

    fn pe() -> ProjectEnvironment {
        ProjectEnvironment::new("myproj", Environment::Production)
    }

    fn backup(id: &str) -> Backup {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();
        Backup {
            id: id.to_string(),
            project: "myproj".to_string(),
            environment: Environment::Production,
            created_at,
            retention_deadline: retention_deadline(created_at, 7),
            size_bytes: 10,
            config: ConfigSnapshot {
                files: vec!["example.com.conf".to_string()],
                absent_files: Vec::new(),
                checksum: "abc".to_string(),
                image: None,
            },
            database: None,
            verification: VerificationStatus::Unverified,
            verified_at: None,
            last_measurement: None,
        }
    }

    #[tokio::test]
    async fn test_list_latest_and_resolve_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        assert!(store.latest(&pe()).await.unwrap().is_none());

        for id in [
            "backup_20250106_120000_000",
            "backup_20250105_090000_000",
            "backup_20250106_130000_500",
        ] {
            store.save(&backup(id)).await.unwrap();
        }

        let ids: Vec<String> = store.list(&pe()).await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(
            ids,
            vec![
                "backup_20250105_090000_000",
                "backup_20250106_120000_000",
                "backup_20250106_130000_500"
            ]
        );
        assert_eq!(
            store.latest(&pe()).await.unwrap().unwrap().id,
            "backup_20250106_130000_500"
        );
        assert_eq!(
            store.resolve(&pe(), "backup_20250106").await.unwrap().id,
            "backup_20250106_130000_500"
        );
        assert_eq!(
            store.resolve(&pe(), "backup_20250105").await.unwrap().id,
            "backup_20250105_090000_000"
        );
        assert!(matches!(
            store.resolve(&pe(), "backup_2024").await,
            Err(DeployError::NotFound(_))
        ));

        // 另一个环境看不到
        let staging = ProjectEnvironment::new("myproj", Environment::Staging);
        assert!(store.list(&staging).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let b = backup("backup_20250106_120000_000");

        let config_dir = store.config_dir(&pe(), &b.id);
        fs::create_dir_all(&config_dir).await.unwrap();
        fs::write(config_dir.join("example.com.conf"), "server {}").await.unwrap();
        store.save(&b).await.unwrap();

        store.delete(&b).await.unwrap();
        assert!(!config_dir.exists());
        assert!(store.list(&pe()).await.unwrap().is_empty());
        assert!(matches!(store.get(&pe(), &b.id).await, Err(DeployError::NotFound(_))));
    }
}
