//! 测试用的内存协作方

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::certs::CertificateAuthority;
use super::command::CommandError;
use super::database::DatabaseTool;
use super::docker::{ConfigTestOutcome, ContainerRuntime, InstanceSpec};
use super::probe::HttpProber;
use super::ToolError;
use crate::domain::database::{DbConnectionConfig, TableStats};

#[derive(Default)]
pub struct RuntimeState {
    pub running: HashSet<String>,
    pub unhealthy: HashSet<String>,
    pub images: HashMap<String, String>,
    pub started: Vec<InstanceSpec>,
    pub stopped: Vec<String>,
    /// `stop_service` / `start_service` 的调用顺序，("stop"|"start", 容器)
    pub service_events: Vec<(&'static str, String)>,
    pub reloads: Vec<String>,
    pub replaced: Vec<(String, String)>,
    pub config_tests: usize,
    pub config_test_fails: bool,
    pub fail_reload: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    pub state: Mutex<RuntimeState>,
}

impl MockRuntime {
    pub fn with_proxy(proxy: &str) -> Self {
        let runtime = Self::default();
        runtime.state.lock().unwrap().running.insert(proxy.to_string());
        runtime
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: &InstanceSpec) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        if !state.running.insert(spec.identity.clone()) {
            return Err(ToolError::Unsupported(format!("{} already running", spec.identity)));
        }
        state.images.insert(spec.identity.clone(), spec.image.clone());
        state.started.push(spec.clone());
        Ok(())
    }

    async fn stop(&self, identity: &str) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        state.running.remove(identity);
        state.stopped.push(identity.to_string());
        Ok(())
    }

    async fn stop_service(&self, identity: &str) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        state.running.remove(identity);
        state.service_events.push(("stop", identity.to_string()));
        Ok(())
    }

    async fn start_service(&self, identity: &str) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        state.running.insert(identity.to_string());
        state.service_events.push(("start", identity.to_string()));
        Ok(())
    }

    async fn signal_reload(&self, identity: &str) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reload {
            return Err(CommandError::NonZeroExit {
                program: "docker".to_string(),
                code: Some(1),
                stderr: "nginx: [emerg] reload failed".to_string(),
            }
            .into());
        }
        state.reloads.push(identity.to_string());
        Ok(())
    }

    async fn test_config(&self, _spec: &InstanceSpec) -> Result<ConfigTestOutcome, ToolError> {
        let mut state = self.state.lock().unwrap();
        state.config_tests += 1;
        Ok(if state.config_test_fails {
            ConfigTestOutcome {
                passed: false,
                output: "nginx: [emerg] unknown directive \"lisen\"".to_string(),
            }
        } else {
            ConfigTestOutcome {
                passed: true,
                output: "nginx: configuration file /etc/nginx/nginx.conf test is successful"
                    .to_string(),
            }
        })
    }

    async fn is_running(&self, identity: &str) -> Result<bool, ToolError> {
        Ok(self.state.lock().unwrap().running.contains(identity))
    }

    async fn is_healthy(&self, identity: &str) -> Result<bool, ToolError> {
        let state = self.state.lock().unwrap();
        Ok(state.running.contains(identity) && !state.unhealthy.contains(identity))
    }

    async fn current_image(&self, identity: &str) -> Result<Option<String>, ToolError> {
        Ok(self.state.lock().unwrap().images.get(identity).cloned())
    }

    async fn replace_image(&self, identity: &str, image: &str) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        state.images.insert(identity.to_string(), image.to_string());
        state.replaced.push((identity.to_string(), image.to_string()));
        Ok(())
    }
}

/// 应用容器的连接池：容器运行时对数据库保持连接
#[derive(Clone)]
pub struct AppPool {
    pub runtime: Arc<MockRuntime>,
    pub container: String,
    pub database: String,
    pub connections: u64,
}

#[derive(Default)]
pub struct DatabaseState {
    pub databases: HashMap<String, TableStats>,
    pub connections: HashMap<String, u64>,
    pub app_pool: Option<AppPool>,
    pub dropped: Vec<String>,
    pub restored: Vec<String>,
    pub fail_restore: bool,
    /// dump 文件的最小长度（模拟真实 dump 的体积）
    pub dump_padding: usize,
}

pub struct MockDatabase {
    pub state: Mutex<DatabaseState>,
}

impl MockDatabase {
    pub fn with_database(name: &str, stats: TableStats) -> Self {
        let mut state = DatabaseState {
            dump_padding: 4096,
            ..Default::default()
        };
        state.databases.insert(name.to_string(), stats);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn stats(&self, name: &str) -> Option<TableStats> {
        self.state.lock().unwrap().databases.get(name).copied()
    }

    fn read_dump(dump: &Path) -> Result<TableStats, ToolError> {
        let content = std::fs::read_to_string(dump)?;
        serde_json::from_str(content.trim()).map_err(|_| ToolError::UnexpectedOutput {
            tool: "pg_restore".to_string(),
            output: "input file does not appear to be a valid archive".to_string(),
        })
    }

    fn restore_error() -> ToolError {
        CommandError::NonZeroExit {
            program: "pg_restore".to_string(),
            code: Some(1),
            stderr: "pg_restore: error: could not execute query".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl DatabaseTool for MockDatabase {
    async fn dump(&self, conn: &DbConnectionConfig, dest: &Path) -> Result<u64, ToolError> {
        let (stats, padding) = {
            let state = self.state.lock().unwrap();
            let stats = state.databases.get(&conn.database).copied().ok_or_else(|| {
                ToolError::UnexpectedOutput {
                    tool: "pg_dump".to_string(),
                    output: format!("database \"{}\" does not exist", conn.database),
                }
            })?;
            (stats, state.dump_padding)
        };
        let mut content = serde_json::to_string(&stats).map_err(std::io::Error::from)?;
        while content.len() < padding {
            content.push(' ');
        }
        std::fs::write(dest, &content)?;
        Ok(content.len() as u64)
    }

    async fn restore(&self, conn: &DbConnectionConfig, dump: &Path) -> Result<(), ToolError> {
        if self.state.lock().unwrap().fail_restore {
            return Err(Self::restore_error());
        }
        let stats = Self::read_dump(dump)?;
        let mut state = self.state.lock().unwrap();
        state.databases.insert(conn.database.clone(), stats);
        state.restored.push(conn.database.clone());
        Ok(())
    }

    async fn restore_into_new(
        &self,
        conn: &DbConnectionConfig,
        dump: &Path,
    ) -> Result<(), ToolError> {
        {
            let mut state = self.state.lock().unwrap();
            // 先建库，失败时调用方负责删除
            state.databases.insert(conn.database.clone(), TableStats::default());
            if state.fail_restore {
                return Err(Self::restore_error());
            }
        }
        let stats = Self::read_dump(dump)?;
        self.state
            .lock()
            .unwrap()
            .databases
            .insert(conn.database.clone(), stats);
        Ok(())
    }

    async fn drop_database(&self, conn: &DbConnectionConfig) -> Result<(), ToolError> {
        let mut state = self.state.lock().unwrap();
        state.databases.remove(&conn.database);
        state.dropped.push(conn.database.clone());
        Ok(())
    }

    async fn active_connections(&self, conn: &DbConnectionConfig) -> Result<u64, ToolError> {
        let (other, pool) = {
            let state = self.state.lock().unwrap();
            let other = state.connections.get(&conn.database).copied().unwrap_or(0);
            (other, state.app_pool.clone())
        };
        let pooled = match pool {
            Some(pool)
                if pool.database == conn.database
                    && pool.runtime.state.lock().unwrap().running.contains(&pool.container) =>
            {
                pool.connections
            }
            _ => 0,
        };
        Ok(other + pooled)
    }

    async fn table_stats(&self, conn: &DbConnectionConfig) -> Result<TableStats, ToolError> {
        self.stats(&conn.database)
            .ok_or_else(|| ToolError::UnexpectedOutput {
                tool: "psql".to_string(),
                output: format!("database \"{}\" does not exist", conn.database),
            })
    }
}

#[derive(Default)]
pub struct MockCerts {
    pub invalid: Mutex<HashSet<String>>,
}

#[async_trait]
impl CertificateAuthority for MockCerts {
    async fn cert_exists_and_valid(&self, domain: &str) -> Result<bool, ToolError> {
        Ok(!self.invalid.lock().unwrap().contains(domain))
    }
}

pub struct MockProber {
    pub status: Mutex<u16>,
    /// 每次探测的响应延迟
    pub delay: Mutex<Duration>,
    pub calls: Mutex<Vec<(String, Option<SocketAddr>)>>,
}

impl MockProber {
    pub fn returning(status: u16) -> Self {
        Self {
            status: Mutex::new(status),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpProber for MockProber {
    async fn probe(
        &self,
        url: &str,
        resolve_to: Option<SocketAddr>,
        _timeout: Duration,
    ) -> Result<u16, ToolError> {
        self.calls.lock().unwrap().push((url.to_string(), resolve_to));
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let status = *self.status.lock().unwrap();
        if status == 0 {
            return Err(ToolError::Http("connection refused".to_string()));
        }
        Ok(status)
    }
}
