//! 持久化状态模块
//!
//! 部署清单、备份元数据、文件锁，以及把它们连同外部协作方组装在一起的应用状态

pub mod app_state;
pub mod backup_store;
pub mod lock;
pub mod manifest_store;

pub use app_state::AppState;
pub use backup_store::BackupStore;
pub use lock::{LockGuard, LockManager};
pub use manifest_store::ManifestStore;

use serde::Serialize;
use std::path::Path;
use tokio::fs;

/// 原子写入 JSON（先写临时文件再重命名）
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &content).await?;
    fs::rename(&temp_path, path).await
}
