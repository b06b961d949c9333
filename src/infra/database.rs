//! 数据库工具
//!
//! 通过 `docker exec` 调用数据库容器内的 pg_dump / pg_restore / psql / mysqldump / mysql

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use super::command::CommandRunner;
use super::ToolError;
use crate::domain::database::{DatabaseType, DbConnectionConfig, TableStats};

/// 数据库能力
#[async_trait]
pub trait DatabaseTool: Send + Sync {
    /// 导出一致性快照到 `dest`，返回文件大小
    async fn dump(&self, conn: &DbConnectionConfig, dest: &Path) -> Result<u64, ToolError>;
    /// 用 dump 替换目标数据库
    async fn restore(&self, conn: &DbConnectionConfig, dump: &Path) -> Result<(), ToolError>;
    /// 创建新库并加载 dump（备份校验用）
    async fn restore_into_new(
        &self,
        conn: &DbConnectionConfig,
        dump: &Path,
    ) -> Result<(), ToolError>;
    async fn drop_database(&self, conn: &DbConnectionConfig) -> Result<(), ToolError>;
    /// 目标库上除自己外的活跃连接数
    async fn active_connections(&self, conn: &DbConnectionConfig) -> Result<u64, ToolError>;
    async fn table_stats(&self, conn: &DbConnectionConfig) -> Result<TableStats, ToolError>;
}

/// docker exec 实现
pub struct DockerDatabaseTool {
    timeout: Duration,
}

impl DockerDatabaseTool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 构造 `docker exec` 参数（密码通过环境变量传入）
    fn exec_args(conn: &DbConnectionConfig, interactive: bool, tool: &[&str]) -> Vec<String> {
        let (_, password) = conn.credentials();
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        if let Some(pwd) = password {
            let var = match conn.db_type {
                DatabaseType::Postgres => "PGPASSWORD",
                DatabaseType::Mysql => "MYSQL_PWD",
            };
            args.extend(["-e".to_string(), format!("{}={}", var, pwd)]);
        }
        args.push(conn.container.clone());
        args.extend(tool.iter().map(|s| s.to_string()));
        args
    }

    async fn exec(&self, conn: &DbConnectionConfig, tool: &[&str]) -> Result<String, ToolError> {
        let args = Self::exec_args(conn, false, tool);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = CommandRunner::run_checked("docker", &args, self.timeout).await?;
        Ok(result.stdout)
    }

    async fn exec_stdin(
        &self,
        conn: &DbConnectionConfig,
        tool: &[&str],
        input: &Path,
    ) -> Result<(), ToolError> {
        let args = Self::exec_args(conn, true, tool);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        CommandRunner::run_with_stdin_file("docker", &args, input, self.timeout).await?;
        Ok(())
    }

    /// 在维护库上执行 SQL
    async fn admin_sql(&self, conn: &DbConnectionConfig, statements: &[String]) -> Result<String, ToolError> {
        let (user, _) = conn.credentials();
        match conn.db_type {
            DatabaseType::Postgres => {
                let mut tool = vec!["psql", "-U", user.as_str(), "-d", "postgres", "-v", "ON_ERROR_STOP=1", "-tA"];
                for stmt in statements {
                    tool.push("-c");
                    tool.push(stmt);
                }
                self.exec(conn, &tool).await
            }
            DatabaseType::Mysql => {
                let joined = statements.join("; ");
                self.exec(conn, &["mysql", "-u", user.as_str(), "-N", "-B", "-e", joined.as_str()])
                    .await
            }
        }
    }

    async fn load(&self, conn: &DbConnectionConfig, dump: &Path) -> Result<(), ToolError> {
        let (user, _) = conn.credentials();
        match conn.db_type {
            DatabaseType::Postgres => {
                self.exec_stdin(
                    conn,
                    &[
                        "pg_restore",
                        "-U",
                        user.as_str(),
                        "-d",
                        conn.database.as_str(),
                        "--no-owner",
                        "--exit-on-error",
                    ],
                    dump,
                )
                .await
            }
            DatabaseType::Mysql => {
                let plain = tempfile::NamedTempFile::new()?;
                let src = dump.to_path_buf();
                let dst = plain.path().to_path_buf();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let mut decoder = GzDecoder::new(std::fs::File::open(src)?);
                    let mut out = std::fs::File::create(dst)?;
                    std::io::copy(&mut decoder, &mut out)?;
                    Ok(())
                })
                .await
                .map_err(|e| ToolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

                self.exec_stdin(conn, &["mysql", "-u", user.as_str(), conn.database.as_str()], plain.path())
                    .await
            }
        }
    }

    async fn create_database(&self, conn: &DbConnectionConfig) -> Result<(), ToolError> {
        self.admin_sql(conn, &[format!("CREATE DATABASE {}", quote_ident(conn))])
            .await
            .map(|_| ())
    }
}

/// 数据库名加引号（名字在注册表加载时已限定为 [A-Za-z0-9_]）
fn quote_ident(conn: &DbConnectionConfig) -> String {
    match conn.db_type {
        DatabaseType::Postgres => format!("\"{}\"", conn.database),
        DatabaseType::Mysql => format!("`{}`", conn.database),
    }
}

/// 解析 `a|b` 或 `a\tb` 形式的两个计数
fn parse_stats(tool: &str, output: &str) -> Result<TableStats, ToolError> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut parts = line.split(|c| c == '|' || c == '\t').map(str::trim);
    let unexpected = || ToolError::UnexpectedOutput {
        tool: tool.to_string(),
        output: output.to_string(),
    };
    let table_count = parts.next().and_then(|s| s.parse().ok()).ok_or_else(unexpected)?;
    let row_count = parts
        .next()
        .map(|s| if s.is_empty() || s == "NULL" { "0" } else { s })
        .and_then(|s| s.parse().ok())
        .ok_or_else(unexpected)?;
    Ok(TableStats {
        table_count,
        row_count,
    })
}

#[async_trait]
impl DatabaseTool for DockerDatabaseTool {
    async fn dump(&self, conn: &DbConnectionConfig, dest: &Path) -> Result<u64, ToolError> {
        let (user, _) = conn.credentials();
        info!(container = %conn.container, database = %conn.database, engine = %conn.db_type, "Dumping database");
        match conn.db_type {
            DatabaseType::Postgres => {
                // 自定义格式：单一快照、压缩、可由更高版本 pg_restore 恢复
                let args = Self::exec_args(conn, false, &["pg_dump", "-U", user.as_str(), "-Fc", "-d", conn.database.as_str()]);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                Ok(CommandRunner::run_to_file("docker", &args, dest, self.timeout).await?)
            }
            DatabaseType::Mysql => {
                let raw = tempfile::NamedTempFile::new()?;
                let args = Self::exec_args(
                    conn,
                    false,
                    &["mysqldump", "-u", user.as_str(), "--single-transaction", "--routines", "--triggers", conn.database.as_str()],
                );
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                CommandRunner::run_to_file("docker", &args, raw.path(), self.timeout).await?;

                let src = raw.path().to_path_buf();
                let dst = dest.to_path_buf();
                let size = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
                    let mut input = std::fs::File::open(src)?;
                    let mut encoder = GzEncoder::new(std::fs::File::create(&dst)?, Compression::default());
                    std::io::copy(&mut input, &mut encoder)?;
                    encoder.finish()?;
                    Ok(std::fs::metadata(&dst)?.len())
                })
                .await
                .map_err(|e| ToolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
                Ok(size)
            }
        }
    }

    async fn restore(&self, conn: &DbConnectionConfig, dump: &Path) -> Result<(), ToolError> {
        match conn.db_type {
            DatabaseType::Postgres => {
                // 先恢复到旁路库，成功后再替换，避免目标库被删了一半
                let side = conn.with_database(format!(
                    "{}__restore_{}",
                    conn.database,
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                ));
                self.create_database(&side).await?;
                if let Err(e) = self.load(&side, dump).await {
                    error!(database = %side.database, error = %e, "Restore into side database failed");
                    if let Err(drop_err) = self.drop_database(&side).await {
                        warn!(database = %side.database, error = %drop_err, "Failed to drop side database");
                    }
                    return Err(e);
                }
                self.admin_sql(
                    conn,
                    &[
                        format!("DROP DATABASE IF EXISTS {}", quote_ident(conn)),
                        format!("ALTER DATABASE {} RENAME TO {}", quote_ident(&side), quote_ident(conn)),
                    ],
                )
                .await?;
                info!(database = %conn.database, "Database swapped in from restored copy");
                Ok(())
            }
            DatabaseType::Mysql => {
                self.admin_sql(
                    conn,
                    &[
                        format!("DROP DATABASE IF EXISTS {}", quote_ident(conn)),
                        format!("CREATE DATABASE {}", quote_ident(conn)),
                    ],
                )
                .await?;
                self.load(conn, dump).await
            }
        }
    }

    async fn restore_into_new(
        &self,
        conn: &DbConnectionConfig,
        dump: &Path,
    ) -> Result<(), ToolError> {
        self.create_database(conn).await?;
        self.load(conn, dump).await
    }

    async fn drop_database(&self, conn: &DbConnectionConfig) -> Result<(), ToolError> {
        self.admin_sql(conn, &[format!("DROP DATABASE IF EXISTS {}", quote_ident(conn))])
            .await
            .map(|_| ())
    }

    async fn active_connections(&self, conn: &DbConnectionConfig) -> Result<u64, ToolError> {
        let sql = match conn.db_type {
            DatabaseType::Postgres => format!(
                "SELECT count(*) FROM pg_stat_activity WHERE datname = '{}' AND pid <> pg_backend_pid()",
                conn.database
            ),
            DatabaseType::Mysql => format!(
                "SELECT COUNT(*) FROM information_schema.PROCESSLIST WHERE DB = '{}' AND ID <> CONNECTION_ID()",
                conn.database
            ),
        };
        let output = self.admin_sql(conn, &[sql]).await?;
        output
            .trim()
            .parse()
            .map_err(|_| ToolError::UnexpectedOutput {
                tool: "active_connections".to_string(),
                output,
            })
    }

    async fn table_stats(&self, conn: &DbConnectionConfig) -> Result<TableStats, ToolError> {
        let (user, _) = conn.credentials();
        match conn.db_type {
            DatabaseType::Postgres => {
                // 精确行数：对每张用户表执行 count(*)
                let sql = "SELECT count(*), coalesce(sum((xpath('/row/c/text()', \
                    query_to_xml(format('select count(*) as c from %I.%I', schemaname, relname), \
                    false, true, '')))[1]::text::bigint), 0) FROM pg_stat_user_tables";
                let output = self
                    .exec(conn, &["psql", "-U", user.as_str(), "-d", conn.database.as_str(), "-tA", "-c", sql])
                    .await?;
                parse_stats("psql", &output)
            }
            DatabaseType::Mysql => {
                let sql = format!(
                    "SELECT COUNT(*), COALESCE(SUM(TABLE_ROWS), 0) FROM information_schema.TABLES WHERE TABLE_SCHEMA = '{}'",
                    conn.database
                );
                let output = self
                    .exec(conn, &["mysql", "-u", user.as_str(), "-N", "-B", "-e", sql.as_str()])
                    .await?;
                parse_stats("mysql", &output)
            }
        }
    }
}
