//! HTTP 探测

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use super::ToolError;

/// HTTP 探测能力
#[async_trait]
pub trait HttpProber: Send + Sync {
    /// 发送 GET，返回状态码
    ///
    /// `resolve_to` 不为空时，URL 中的主机名直接连到该地址（端口仍取 URL 中的端口）
    async fn probe(
        &self,
        url: &str,
        resolve_to: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<u16, ToolError>;
}

/// reqwest 实现
#[derive(Default)]
pub struct ReqwestProber;

impl ReqwestProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn probe(
        &self,
        url: &str,
        resolve_to: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<u16, ToolError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(addr) = resolve_to {
            let parsed = reqwest::Url::parse(url).map_err(|e| ToolError::Http(e.to_string()))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| ToolError::Http(format!("url has no host: {}", url)))?;
            builder = builder.resolve(host, addr);
        }

        let client = builder.build().map_err(|e| ToolError::Http(e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}
