//! XJP Rollout - 平台共享代理 / 数据库的分阶段部署与备份编排
//!
//! 一次部署依次经过：静态校验 → staging 代理实例探测 → 发布闸门 → 部署前备份 →
//! 生产切换（写配置 + reload）→ 健康检查，失败时从备份自动回滚。

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
pub mod state;
