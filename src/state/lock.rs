//! 文件锁
//!
//! `<state_dir>/locks/<key>.lock`，用 `create_new` 保证同一时刻只有一个持有者。
//! 获取失败立即返回 `Busy`，不排队等待。
//! 持有者在本机时只有进程已退出才回收；其他主机的锁按存在时长判定。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{DeployError, DeployResult};

/// 锁文件内容
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: String,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
}

fn this_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

impl LockHolder {
    fn current(purpose: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: this_host(),
            purpose: purpose.to_string(),
            acquired_at: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "pid {} on {} ({}) since {}",
            self.pid, self.host, self.purpose, self.acquired_at
        )
    }
}

/// 锁管理器
#[derive(Clone, Debug)]
pub struct LockManager {
    dir: PathBuf,
    /// 其他主机持有的锁超过该时长视为持有者已消失
    stale_after: Duration,
}

/// 持有中的锁，drop 时释放
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    path: PathBuf,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(key = %self.key, "Lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key = %self.key, error = %e, "Failed to release lock"),
        }
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key))
    }

    /// 获取锁，已被持有时返回 `Busy`
    pub fn acquire(&self, key: &str, purpose: &str) -> DeployResult<LockGuard> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);

        match try_create(&path, purpose) {
            Ok(guard_path) => {
                debug!(key, purpose, "Lock acquired");
                return Ok(LockGuard {
                    key: key.to_string(),
                    path: guard_path,
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let holder = read_holder(&path);
        if self.is_stale(&path, holder.as_ref()) {
            warn!(
                key,
                holder = %holder.as_ref().map(LockHolder::describe).unwrap_or_else(|| "unknown".to_string()),
                "Reclaiming stale lock"
            );
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // 另一个进程可能同时回收并抢先创建
            match try_create(&path, purpose) {
                Ok(guard_path) => {
                    info!(key, purpose, "Lock acquired after reclaiming");
                    return Ok(LockGuard {
                        key: key.to_string(),
                        path: guard_path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(DeployError::Busy {
            key: key.to_string(),
            holder: read_holder(&path)
                .map(|h| h.describe())
                .unwrap_or_else(|| "unknown holder".to_string()),
        })
    }

    fn is_stale(&self, path: &Path, holder: Option<&LockHolder>) -> bool {
        if let Some(h) = holder {
            if h.host == this_host() {
                return !process_alive(h.pid);
            }
        }
        let acquired_at = match holder {
            Some(h) => h.acquired_at,
            // 内容损坏时用文件修改时间
            None => match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };
        let age = Utc::now().signed_duration_since(acquired_at);
        age.to_std().map_or(false, |age| age > self.stale_after)
    }
}

fn try_create(path: &Path, purpose: &str) -> std::io::Result<PathBuf> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let content = serde_json::to_vec(&LockHolder::current(purpose))?;
    file.write_all(&content)?;
    file.sync_all()?;
    Ok(path.to_path_buf())
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}
