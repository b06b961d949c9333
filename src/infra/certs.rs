//! 证书检查
//!
//! 证书由外部签发和续期，这里只读

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::command::{CommandError, CommandRunner};
use super::ToolError;

/// 证书协作方
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// 域名证书是否存在且未过期
    async fn cert_exists_and_valid(&self, domain: &str) -> Result<bool, ToolError>;
}

/// 本地 letsencrypt 目录 (`<cert_dir>/live/<domain>/fullchain.pem`)
pub struct LocalCertificateStore {
    cert_dir: PathBuf,
    timeout: Duration,
}

impl LocalCertificateStore {
    pub fn new(cert_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            timeout,
        }
    }

    pub fn fullchain_path(&self, domain: &str) -> PathBuf {
        live_dir(&self.cert_dir, domain).join("fullchain.pem")
    }
}

fn live_dir(cert_dir: &Path, domain: &str) -> PathBuf {
    cert_dir.join("live").join(domain)
}

#[async_trait]
impl CertificateAuthority for LocalCertificateStore {
    async fn cert_exists_and_valid(&self, domain: &str) -> Result<bool, ToolError> {
        let path = self.fullchain_path(domain);
        if !tokio::fs::try_exists(&path).await? {
            debug!(domain, path = %path.display(), "Certificate not found");
            return Ok(false);
        }
        let path_str = path.display().to_string();
        // -checkend 0：证书当前未过期时退出码为 0
        match CommandRunner::run_checked(
            "openssl",
            &["x509", "-checkend", "0", "-noout", "-in", &path_str],
            self.timeout,
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(CommandError::NonZeroExit { .. }) => {
                debug!(domain, "Certificate expired");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
