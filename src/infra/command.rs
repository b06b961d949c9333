//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 超时控制（超时后强制终止子进程）
//! - stdout 直接写入文件（数据库 dump）
//! - stdin 从文件读取（数据库恢复）

use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 命令超时
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    /// 等待命令完成失败
    #[error("failed to wait for {program}: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 非零退出
    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// 读写重定向文件失败
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// 工具自身的诊断输出（如 pg_restore 的 stderr）
    pub fn diagnostic(&self) -> String {
        match self {
            CommandError::NonZeroExit { stderr, .. } => stderr.trim().to_string(),
            other => other.to_string(),
        }
    }
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandRunner {
    /// 执行简单命令（捕获输出，不检查退出码）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }
        debug!(program, ?args, "Running command");

        let child = cmd.output();
        tokio::select! {
            result = child => {
                result.map_err(|source| CommandError::SpawnFailed { program: program.to_string(), source })
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program, ?timeout, "Command timed out");
                Err(CommandError::Timeout { program: program.to_string(), timeout })
            }
        }
    }

    /// 执行命令，非零退出码视为错误
    pub async fn run_checked(
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let output = Self::run_simple(program, args, None, timeout).await?;
        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if result.status.success() {
            Ok(result)
        } else {
            Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: result.status.code(),
                stderr: result.stderr,
            })
        }
    }

    /// 执行命令并把 stdout 写入文件，返回写入字节数
    pub async fn run_to_file(
        program: &str,
        args: &[&str],
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, CommandError> {
        let io_err = |source| CommandError::Io {
            path: dest.display().to_string(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| CommandError::WaitFailed {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"),
        })?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
            }
            String::from_utf8_lossy(&buf).to_string()
        });

        let copy = async {
            let written = tokio::io::copy(&mut stdout, &mut file).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
            let status = child.wait().await.map_err(|source| CommandError::WaitFailed {
                program: program.to_string(),
                source,
            })?;
            Ok::<_, CommandError>((written, status))
        };

        let (written, status) = tokio::select! {
            result = copy => result?,
            _ = tokio::time::sleep(timeout) => {
                error!(program, ?timeout, "Command timed out");
                return Err(CommandError::Timeout { program: program.to_string(), timeout });
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: status.code(),
                stderr,
            });
        }
        Ok(written)
    }

    /// 执行命令，stdin 来自文件
    pub async fn run_with_stdin_file(
        program: &str,
        args: &[&str],
        src: &Path,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let input = tokio::fs::File::open(src)
            .await
            .map_err(|source| CommandError::Io {
                path: src.display().to_string(),
                source,
            })?
            .into_std()
            .await;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|source| CommandError::WaitFailed { program: program.to_string(), source })?
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program, ?timeout, "Command timed out");
                return Err(CommandError::Timeout { program: program.to_string(), timeout });
            }
        };

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if result.status.success() {
            Ok(result)
        } else {
            Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: result.status.code(),
                stderr: result.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_simple_success() {
        let output = CommandRunner::run_simple("echo", &["hello"], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            None,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(CommandError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let err = CommandRunner::run_checked(
            "sh",
            &["-c", "echo broken >&2; exit 3"],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            CommandError::NonZeroExit { code, ref stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("broken"));
                assert_eq!(err.diagnostic(), "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_simple_timeout() {
        let result =
            CommandRunner::run_simple("sleep", &["5"], None, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_to_file_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let written = CommandRunner::run_to_file(
            "sh",
            &["-c", "printf 'line1\\nline2\\n'"],
            &dest,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(written, 12);

        let result =
            CommandRunner::run_with_stdin_file("cat", &[], &dest, Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(result.stdout, "line1\nline2\n");
    }
}
