//! 备份领域模型

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::database::{DatabaseType, TableStats};
use super::deploy::{timestamp_id, Environment, ProjectEnvironment};

/// 备份 ID 前缀
pub const BACKUP_ID_PREFIX: &str = "backup";

/// 备份校验状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Suspect,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Suspect => "suspect",
        }
    }
}

/// 数据库 dump 产物
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseArtifact {
    pub engine: DatabaseType,
    /// 被备份的数据库名
    pub database: String,
    /// 相对于备份目录的文件名
    pub file: String,
    pub size_bytes: u64,
}

/// 配置快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// 快照中保存的文件
    pub files: Vec<String>,
    /// 部署前不存在的文件（回滚时删除）
    #[serde(default)]
    pub absent_files: Vec<String>,
    pub checksum: String,
    /// 部署前的应用镜像
    pub image: Option<String>,
}

/// 备份元数据
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub project: String,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
    pub size_bytes: u64,
    pub config: ConfigSnapshot,
    pub database: Option<DatabaseArtifact>,
    pub verification: VerificationStatus,
    pub verified_at: Option<DateTime<Utc>>,
    /// 最近一次校验得到的度量
    pub last_measurement: Option<TableStats>,
}

impl Backup {
    /// 新备份的 ID 和保留期限
    pub fn new_id(created_at: DateTime<Utc>) -> String {
        timestamp_id(BACKUP_ID_PREFIX, created_at)
    }

    pub fn project_env(&self) -> ProjectEnvironment {
        ProjectEnvironment::new(self.project.clone(), self.environment)
    }

    /// 是否已过保留期限
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.retention_deadline
    }
}

/// 保留期限 = 创建时间 + 保留天数
pub fn retention_deadline(created_at: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    created_at + Duration::days(i64::from(retention_days))
}

/// 从备份 ID 解析创建时间
pub fn parse_backup_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let rest = id.strip_prefix(BACKUP_ID_PREFIX)?.strip_prefix('_')?;
    NaiveDateTime::parse_from_str(rest, "%Y%m%d_%H%M%S_%3f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_id_roundtrips_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 14, 30, 0).unwrap();
        let id = Backup::new_id(at);
        assert_eq!(id, "backup_20250106_143000_000");
        assert_eq!(parse_backup_timestamp(&id), Some(at));
        assert_eq!(parse_backup_timestamp("backup_garbage"), None);
        assert_eq!(parse_backup_timestamp("deploy_20250106_143000_000"), None);
    }

    #[test]
    fn test_retention_deadline() {
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();
        let deadline = retention_deadline(at, 7);
        assert_eq!(deadline, Utc.with_ymd_and_hms(2025, 1, 13, 0, 0, 0).unwrap());
    }
}
