//! 配置模块
//!
//! 环境变量解析与项目注册表

pub mod env;
pub mod project;

pub use env::{EnvConfig, ProxyConfig, RetryPolicy, TimeoutConfig};
pub use project::{ProjectEnvConfig, ProjectRegistry, YamlProjectRegistry};
