//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 平台根目录（projects.yml、nginx 配置所在）
    pub platform_root: PathBuf,
    /// 项目注册表文件
    pub projects_file: PathBuf,
    /// 线上 nginx conf.d 目录
    pub live_conf_dir: PathBuf,
    /// 证书目录（宿主机）
    pub cert_dir: PathBuf,
    /// 证书目录在代理容器内的挂载点
    pub cert_mount: String,
    pub backup_dir: PathBuf,
    pub state_dir: PathBuf,
    pub proxy: ProxyConfig,
    /// 应用容器所在 compose 文件（镜像替换用）
    pub compose_file: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub retry: RetryPolicy,
    /// 小于该值的 dump 视为失败
    pub min_dump_bytes: u64,
    /// staged 清单在该时间内可以直接 --confirm 复用
    pub staging_reuse_window: Duration,
}

/// 共享反向代理
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// 线上代理容器名
    pub container: String,
    /// staging / 配置测试使用的镜像
    pub image: String,
    pub network: Option<String>,
    /// 容器内 conf.d 挂载点
    pub conf_mount: String,
    pub staging_port: u16,
    pub reload_command: String,
    pub test_command: String,
    /// 可选的代理状态 URL（如 stub_status）
    pub status_url: Option<String>,
}

/// 超时
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    /// 容器启停、配置测试
    pub command: Duration,
    /// 数据库 dump / restore
    pub database: Duration,
    /// 单次健康探测
    pub probe: Duration,
    /// 健康检查总预算
    pub health_budget: Duration,
    /// 整个部署的上限
    pub deploy: Duration,
}

impl TimeoutConfig {
    /// 其他主机持有的锁超过这个时长视为陈旧：一次部署加上回滚中的数据库恢复
    pub fn lock_stale_after(&self) -> Duration {
        self.deploy.saturating_add(self.database)
    }
}

/// 健康检查重试策略
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次重试前的等待时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let platform_root = env_path("ROLLOUT_PLATFORM_ROOT", "/opt/platform");
        let projects_file = env::var("ROLLOUT_PROJECTS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| platform_root.join("projects.yml"));
        let live_conf_dir = env::var("ROLLOUT_LIVE_CONF_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| platform_root.join("nginx/conf.d"));

        let cert_dir = env_path("ROLLOUT_CERT_DIR", "/etc/letsencrypt");
        let cert_mount =
            env::var("ROLLOUT_CERT_MOUNT").unwrap_or_else(|_| "/etc/letsencrypt".to_string());

        let backup_dir = env_path("ROLLOUT_BACKUP_DIR", "/var/backups/rollout");
        let state_dir = env_path("ROLLOUT_STATE_DIR", "/var/lib/rollout");

        let proxy = ProxyConfig::from_env();
        let compose_file = env::var("ROLLOUT_COMPOSE_FILE").ok().map(PathBuf::from);

        let timeouts = TimeoutConfig {
            command: env_secs("ROLLOUT_COMMAND_TIMEOUT_SECS", 120),
            database: env_secs("ROLLOUT_DB_TIMEOUT_SECS", constants::DB_TIMEOUT_SECS),
            probe: env_secs("ROLLOUT_PROBE_TIMEOUT_SECS", 5),
            health_budget: env_secs("ROLLOUT_HEALTH_BUDGET_SECS", 60),
            deploy: env_secs("ROLLOUT_DEPLOY_TIMEOUT_SECS", constants::DEPLOY_TIMEOUT_SECS),
        };

        let retry = RetryPolicy {
            max_retries: env_parse("ROLLOUT_HEALTH_RETRIES", constants::HEALTH_RETRIES),
            initial_backoff: Duration::from_millis(env_parse("ROLLOUT_BACKOFF_MS", 1000)),
            max_backoff: Duration::from_millis(env_parse("ROLLOUT_MAX_BACKOFF_MS", 10_000)),
        };

        Self {
            platform_root,
            projects_file,
            live_conf_dir,
            cert_dir,
            cert_mount,
            backup_dir,
            state_dir,
            proxy,
            compose_file,
            timeouts,
            retry,
            min_dump_bytes: env_parse("ROLLOUT_MIN_DUMP_BYTES", constants::MIN_DUMP_BYTES),
            staging_reuse_window: env_secs(
                "ROLLOUT_STAGING_REUSE_SECS",
                constants::STAGING_REUSE_WINDOW_SECS,
            ),
        }
    }

    /// 把证书的容器路径映射到宿主机路径
    pub fn host_cert_path(&self, path: &str) -> PathBuf {
        match path.strip_prefix(self.cert_mount.as_str()) {
            Some(rest) => self.cert_dir.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.state_dir.join("manifests")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self {
            container: env::var("ROLLOUT_PROXY_CONTAINER")
                .unwrap_or_else(|_| "platform-nginx".to_string()),
            image: env::var("ROLLOUT_PROXY_IMAGE")
                .unwrap_or_else(|_| "nginx:1.27-alpine".to_string()),
            network: env::var("ROLLOUT_PROXY_NETWORK").ok().filter(|s| !s.is_empty()),
            conf_mount: env::var("ROLLOUT_PROXY_CONF_MOUNT")
                .unwrap_or_else(|_| "/etc/nginx/conf.d".to_string()),
            staging_port: env_parse("ROLLOUT_STAGING_PORT", constants::STAGING_PORT),
            reload_command: env::var("ROLLOUT_PROXY_RELOAD_CMD")
                .unwrap_or_else(|_| "nginx -s reload".to_string()),
            test_command: env::var("ROLLOUT_PROXY_TEST_CMD")
                .unwrap_or_else(|_| "nginx -t".to_string()),
            status_url: env::var("ROLLOUT_PROXY_STATUS_URL").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

/// 常量
pub mod constants {
    /// 部署超时（秒）
    pub const DEPLOY_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 数据库 dump / restore 超时（秒）
    pub const DB_TIMEOUT_SECS: u64 = 3600;

    /// 健康检查重试次数
    pub const HEALTH_RETRIES: u32 = 3;

    /// 最小 dump 大小（字节）
    pub const MIN_DUMP_BYTES: u64 = 1024;

    /// staging 代理绑定的宿主机端口
    pub const STAGING_PORT: u16 = 8443;

    /// staged 清单复用窗口（秒）
    pub const STAGING_REUSE_WINDOW_SECS: u64 = 1800;

    /// 默认备份保留天数
    pub const DEFAULT_RETENTION_DAYS: u32 = 7;

    /// 备份校验默认抽样数
    pub const DEFAULT_VERIFY_SAMPLE: usize = 3;

    /// 抽样范围：每个环境最近的 N 个备份
    pub const VERIFY_RECENT_WINDOW: usize = 10;

    /// 行数低于上次度量的该比例时判定可疑
    pub const SUSPECT_ROW_RATIO: f64 = 0.5;

    /// 平台级代理锁
    pub const PROXY_LOCK_KEY: &str = "proxy";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
