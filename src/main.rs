//! XJP Rollout 命令行
//!
//! stdout 只输出 JSON 报告，日志和摘要写 stderr。
//! Ctrl-C / SIGTERM 触发取消，staging 实例仍会被销毁。

use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use xjp_rollout::cli::{self, Cli, ExitPolicy};
use xjp_rollout::config::EnvConfig;
use xjp_rollout::error::DeployError;
use xjp_rollout::state::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn report_error(err: &DeployError, policy: ExitPolicy) -> ExitCode {
    let response = err.to_response();
    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{{\"error\":\"{}\"}}", err.kind()),
    }
    eprintln!("error: {}", err);
    ExitCode::from(policy.code_for(err) as u8)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = EnvConfig::from_env();
    cli.apply_overrides(&mut config);
    let policy = cli.command.exit_policy();

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::warn!("Shutdown signal received, cancelling");
        signal_token.cancel();
    });

    let state = match AppState::new(config, cancel) {
        Ok(state) => state,
        Err(e) => return Ok(report_error(&e, policy)),
    };

    match cli::run(&state, cli.command).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output.report)?);
            eprintln!("{}", output.summary);
            Ok(ExitCode::from(output.exit_code as u8))
        }
        Err(e) => Ok(report_error(&e, policy)),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to create runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
