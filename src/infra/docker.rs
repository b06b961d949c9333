//! 容器运行时
//!
//! 通过 docker CLI 实现 start / stop / reload / test-config / health 等操作

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::command::{CommandError, CommandRunner};
use super::ToolError;

/// 挂载
#[derive(Clone, Debug, PartialEq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// 端口绑定
#[derive(Clone, Debug, PartialEq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
    /// "tcp" | "udp"
    pub protocol: &'static str,
}

/// 一次性实例（staging 代理、nginx -t）描述
#[derive(Clone, Debug)]
pub struct InstanceSpec {
    pub identity: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub network: Option<String>,
    /// 覆盖镜像默认命令
    pub command: Vec<String>,
}

/// `nginx -t` 结果
#[derive(Clone, Debug)]
pub struct ConfigTestOutcome {
    pub passed: bool,
    pub output: String,
}

/// 容器运行时能力
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 启动实例（后台运行）
    async fn start(&self, spec: &InstanceSpec) -> Result<(), ToolError>;
    /// 停止并删除实例，不存在时视为成功
    async fn stop(&self, identity: &str) -> Result<(), ToolError>;
    /// 停止容器但保留它（`docker stop`），之后可用 `start_service` 重新启动
    async fn stop_service(&self, identity: &str) -> Result<(), ToolError>;
    async fn start_service(&self, identity: &str) -> Result<(), ToolError>;
    /// 让运行中的代理重新加载配置（不重启）
    async fn signal_reload(&self, identity: &str) -> Result<(), ToolError>;
    /// 在一次性容器中测试配置
    async fn test_config(&self, spec: &InstanceSpec) -> Result<ConfigTestOutcome, ToolError>;
    async fn is_running(&self, identity: &str) -> Result<bool, ToolError>;
    async fn is_healthy(&self, identity: &str) -> Result<bool, ToolError>;
    async fn current_image(&self, identity: &str) -> Result<Option<String>, ToolError>;
    /// 用新镜像重建应用容器
    async fn replace_image(&self, identity: &str, image: &str) -> Result<(), ToolError>;
}

/// docker CLI 实现
pub struct DockerRuntime {
    /// 代理内执行的 reload 命令
    reload_command: Vec<String>,
    /// 应用容器所在的 compose 文件（用于镜像替换）
    compose_file: Option<PathBuf>,
    timeout: Duration,
}

impl DockerRuntime {
    pub fn new(reload_command: &str, compose_file: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            reload_command: reload_command.split_whitespace().map(String::from).collect(),
            compose_file,
            timeout,
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String, ToolError> {
        let result = CommandRunner::run_checked("docker", args, self.timeout).await?;
        Ok(result.stdout)
    }

    async fn inspect(&self, identity: &str, format: &str) -> Result<Option<String>, ToolError> {
        match CommandRunner::run_checked(
            "docker",
            &["inspect", "--format", format, identity],
            self.timeout,
        )
        .await
        {
            Ok(result) => Ok(Some(result.stdout.trim().to_string())),
            // 容器不存在
            Err(CommandError::NonZeroExit { ref stderr, .. })
                if stderr.contains("No such object") || stderr.contains("No such container") =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn run_args(spec: &InstanceSpec, detached: bool) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if detached {
        args.push("-d".to_string());
    } else {
        args.push("--rm".to_string());
    }
    args.extend(["--name".to_string(), spec.identity.clone()]);
    if let Some(ref network) = spec.network {
        args.extend(["--network".to_string(), network.clone()]);
    }
    for port in &spec.ports {
        args.extend([
            "-p".to_string(),
            format!("{}:{}/{}", port.host, port.container, port.protocol),
        ]);
    }
    for mount in &spec.mounts {
        args.extend(["-v".to_string(), mount.to_arg()]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &InstanceSpec) -> Result<(), ToolError> {
        let args = run_args(spec, true);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!(identity = %spec.identity, image = %spec.image, "Starting container");
        self.docker(&args).await?;
        Ok(())
    }

    async fn stop(&self, identity: &str) -> Result<(), ToolError> {
        match self.docker(&["rm", "-f", identity]).await {
            Ok(_) => Ok(()),
            Err(ToolError::Command(CommandError::NonZeroExit { ref stderr, .. }))
                if stderr.contains("No such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_service(&self, identity: &str) -> Result<(), ToolError> {
        info!(identity, "Stopping container");
        self.docker(&["stop", identity]).await?;
        Ok(())
    }

    async fn start_service(&self, identity: &str) -> Result<(), ToolError> {
        info!(identity, "Starting stopped container");
        self.docker(&["start", identity]).await?;
        Ok(())
    }

    async fn signal_reload(&self, identity: &str) -> Result<(), ToolError> {
        let mut args = vec!["exec", identity];
        args.extend(self.reload_command.iter().map(String::as_str));
        info!(identity, command = ?self.reload_command, "Reloading proxy");
        self.docker(&args).await?;
        Ok(())
    }

    async fn test_config(&self, spec: &InstanceSpec) -> Result<ConfigTestOutcome, ToolError> {
        let args = run_args(spec, false);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = CommandRunner::run_simple("docker", &args, None, self.timeout).await?;
        // nginx -t 的结果写在 stderr
        let mut text = String::from_utf8_lossy(&output.stderr).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Ok(ConfigTestOutcome {
            passed: output.status.success(),
            output: text.trim().to_string(),
        })
    }

    async fn is_running(&self, identity: &str) -> Result<bool, ToolError> {
        Ok(self
            .inspect(identity, "{{.State.Running}}")
            .await?
            .map_or(false, |s| s == "true"))
    }

    async fn is_healthy(&self, identity: &str) -> Result<bool, ToolError> {
        let status = self
            .inspect(
                identity,
                "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}",
            )
            .await?;
        Ok(matches!(status.as_deref(), Some("healthy") | Some("running")))
    }

    async fn current_image(&self, identity: &str) -> Result<Option<String>, ToolError> {
        self.inspect(identity, "{{.Config.Image}}").await
    }

    async fn replace_image(&self, identity: &str, image: &str) -> Result<(), ToolError> {
        let compose_file = self.compose_file.as_ref().ok_or_else(|| {
            ToolError::Unsupported(format!(
                "cannot replace image of {}: no compose file configured",
                identity
            ))
        })?;
        let compose_file = compose_file.display().to_string();

        self.docker(&["pull", image]).await?;

        // compose 文件中应用服务的镜像写作 ${ROLLOUT_IMAGE}
        let mut cmd = tokio::process::Command::new("docker");
        cmd.args([
            "compose",
            "-f",
            &compose_file,
            "up",
            "-d",
            "--no-deps",
            "--force-recreate",
            identity,
        ])
        .env("ROLLOUT_IMAGE", image)
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CommandError::Timeout {
                program: "docker compose".to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::SpawnFailed {
                program: "docker compose".to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(identity, image, %stderr, "Image replacement failed");
            return Err(CommandError::NonZeroExit {
                program: "docker compose".to_string(),
                code: output.status.code(),
                stderr,
            }
            .into());
        }
        info!(identity, image, "Container recreated with new image");
        Ok(())
    }
}
