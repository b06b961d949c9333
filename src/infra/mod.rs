//! 基础设施模块
//!
//! 封装外部依赖（容器运行时、数据库工具、证书、HTTP 探测、命令执行）。
//! 每个外部能力都是一个 trait，编排逻辑只依赖 trait，测试使用 `mock` 实现。

pub mod certs;
pub mod command;
pub mod database;
pub mod docker;
pub mod probe;

#[cfg(test)]
pub mod mock;

pub use certs::{CertificateAuthority, LocalCertificateStore};
pub use command::{CommandError, CommandRunner};
pub use database::{DatabaseTool, DockerDatabaseTool};
pub use docker::{ContainerRuntime, DockerRuntime, InstanceSpec, Mount, PortBinding};
pub use probe::{HttpProber, ReqwestProber};

/// 外部协作方错误
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected output from {tool}: {output}")]
    UnexpectedOutput { tool: String, output: String },
    #[error("{0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// 工具诊断信息
    pub fn diagnostic(&self) -> String {
        match self {
            ToolError::Command(e) => e.diagnostic(),
            other => other.to_string(),
        }
    }
}
