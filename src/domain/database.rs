//! 数据库相关领域模型

use serde::{Deserialize, Serialize};

/// 数据库类型
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Postgres,
    Mysql,
}

impl DatabaseType {
    /// 备份文件扩展名
    pub fn dump_extension(&self) -> &'static str {
        match self {
            // pg_dump -Fc 自带压缩
            DatabaseType::Postgres => "dump",
            DatabaseType::Mysql => "sql.gz",
        }
    }

    fn default_username(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "root",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::Postgres => write!(f, "postgres"),
            DatabaseType::Mysql => write!(f, "mysql"),
        }
    }
}

/// 数据库连接配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DbConnectionConfig {
    pub db_type: DatabaseType,
    /// Docker 容器名称
    pub container: String,
    /// 数据库名称
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl DbConnectionConfig {
    /// 获取数据库凭据
    pub fn credentials(&self) -> (String, Option<String>) {
        let username = self
            .username
            .clone()
            .unwrap_or_else(|| self.db_type.default_username().to_string());
        (username, self.password.clone())
    }

    /// 同一实例上的另一个数据库（用于临时恢复库）
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }
}

/// 表统计（备份校验的度量）
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TableStats {
    pub table_count: u64,
    pub row_count: u64,
}

impl TableStats {
    pub fn is_empty(&self) -> bool {
        self.table_count == 0 || self.row_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(db_type: DatabaseType) -> DbConnectionConfig {
        DbConnectionConfig {
            db_type,
            container: "platform-postgres".to_string(),
            database: "myproj".to_string(),
            username: None,
            password: None,
        }
    }

    #[test]
    fn test_default_credentials() {
        assert_eq!(conn(DatabaseType::Postgres).credentials().0, "postgres");
        assert_eq!(conn(DatabaseType::Mysql).credentials().0, "root");
    }

    #[test]
    fn test_with_database_keeps_container() {
        let scratch = conn(DatabaseType::Postgres).with_database("verify_abc");
        assert_eq!(scratch.database, "verify_abc");
        assert_eq!(scratch.container, "platform-postgres");
    }

    #[test]
    fn test_table_stats_is_empty() {
        assert!(TableStats::default().is_empty());
        assert!(TableStats { table_count: 3, row_count: 0 }.is_empty());
        assert!(!TableStats { table_count: 3, row_count: 10 }.is_empty());
    }
}
