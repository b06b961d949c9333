//! 服务层测试夹具：临时目录 + 内存协作方

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::config::project::YamlProjectRegistry;
use crate::domain::database::TableStats;
use crate::domain::deploy::{Environment, ProjectEnvironment};
use crate::domain::proxy_config::CandidateConfig;
use crate::infra::mock::{AppPool, MockCerts, MockDatabase, MockProber, MockRuntime};
use crate::state::app_state::Collaborators;
use crate::state::AppState;

pub const PROXY: &str = "platform-nginx";
pub const APP: &str = "myproj-backend";
pub const APP_IMAGE: &str = "ghcr.io/example/myproj:1.0";

pub const REGISTRY: &str = r#"
projects:
  myproj:
    domains:
      production: [example.com]
      staging:
        domains: [staging.example.com]
    containers:
      backend: { name: myproj-backend, port: 8000 }
    database:
      engine: postgres
      container: platform-postgres
      name: myproj
    backup:
      retention_days: 7
    health:
      path: /health
"#;

/// 一个站点的 nginx 配置
pub fn site_conf(domain: &str, reuseport: bool, quic: bool) -> String {
    let quic_listener = match (quic, reuseport) {
        (true, true) => "listen 443 quic reuseport;",
        (true, false) => "listen 443 quic;",
        (false, _) => "",
    };
    let ssl_listener = if reuseport && !quic {
        "listen 443 ssl reuseport;"
    } else {
        "listen 443 ssl;"
    };
    format!(
        r#"server {{
    listen 80;
    server_name {domain};
    return 301 https://$host$request_uri;
}}

server {{
    {ssl_listener}
    {quic_listener}
    http2 on;
    server_name {domain};

    ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;

    location / {{
        set $backend_host "myproj-backend";
        proxy_pass http://$backend_host:8000;
    }}
}}
"#
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub state: AppState,
    pub runtime: Arc<MockRuntime>,
    pub database: Arc<MockDatabase>,
    pub certs: Arc<MockCerts>,
    pub prober: Arc<MockProber>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut config = EnvConfig::from_env();
        config.platform_root = root.to_path_buf();
        config.projects_file = root.join("projects.yml");
        config.live_conf_dir = root.join("live");
        config.cert_dir = root.join("certs");
        config.cert_mount = "/etc/letsencrypt".to_string();
        config.backup_dir = root.join("backups");
        config.state_dir = root.join("state");
        config.proxy.container = PROXY.to_string();
        config.proxy.staging_port = 8443;
        config.proxy.status_url = None;
        config.timeouts.probe = Duration::from_millis(200);
        config.timeouts.health_budget = Duration::from_secs(2);
        config.timeouts.deploy = Duration::from_secs(600);
        config.retry.max_retries = 3;
        config.retry.initial_backoff = Duration::from_millis(1);
        config.retry.max_backoff = Duration::from_millis(5);
        config.min_dump_bytes = 1024;
        config.staging_reuse_window = Duration::from_secs(600);

        std::fs::create_dir_all(&config.live_conf_dir).unwrap();
        std::fs::write(
            config.live_conf_dir.join("example.com.conf"),
            site_conf("example.com", true, true),
        )
        .unwrap();
        for domain in ["example.com", "staging.example.com", "other.example.com"] {
            let live = config.cert_dir.join("live").join(domain);
            std::fs::create_dir_all(&live).unwrap();
            std::fs::write(live.join("fullchain.pem"), "cert").unwrap();
            std::fs::write(live.join("privkey.pem"), "key").unwrap();
        }
        std::fs::write(&config.projects_file, REGISTRY).unwrap();

        let runtime = Arc::new(MockRuntime::with_proxy(PROXY));
        {
            let mut rt = runtime.state.lock().unwrap();
            rt.running.insert(APP.to_string());
            rt.images.insert(APP.to_string(), APP_IMAGE.to_string());
        }
        let database = Arc::new(MockDatabase::with_database(
            "myproj",
            TableStats {
                table_count: 12,
                row_count: 3400,
            },
        ));
        let certs = Arc::new(MockCerts::default());
        let prober = Arc::new(MockProber::returning(200));

        let registry = YamlProjectRegistry::from_yaml(REGISTRY).unwrap();
        let collaborators = Collaborators {
            runtime: runtime.clone(),
            database: database.clone(),
            certs: certs.clone(),
            prober: prober.clone(),
        };
        let state = AppState::with_collaborators(
            config,
            Arc::new(registry),
            collaborators,
            CancellationToken::new(),
        );

        Self {
            dir,
            state,
            runtime,
            database,
            certs,
            prober,
        }
    }

    /// 共享同一目录和协作方的另一个调用（模拟并发进程）
    pub fn second_invocation(&self) -> AppState {
        AppState::with_collaborators(
            self.state.config.clone(),
            self.state.registry.clone(),
            Collaborators {
                runtime: self.runtime.clone(),
                database: self.database.clone(),
                certs: self.certs.clone(),
                prober: self.prober.clone(),
            },
            CancellationToken::new(),
        )
    }

    /// 应用容器运行期间对 myproj 库保持 `connections` 个连接
    pub fn connect_app_pool(&self, connections: u64) {
        self.database.state.lock().unwrap().app_pool = Some(AppPool {
            runtime: self.runtime.clone(),
            container: APP.to_string(),
            database: "myproj".to_string(),
            connections,
        });
    }

    pub fn pe(&self) -> ProjectEnvironment {
        ProjectEnvironment::new("myproj", Environment::Production)
    }

    pub fn candidate(&self, files: &[(&str, String)]) -> CandidateConfig {
        let files: BTreeMap<String, String> = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.clone()))
            .collect();
        CandidateConfig::new(files, None)
    }

    /// 合法的候选：替换 example.com.conf
    pub fn valid_candidate(&self, marker: &str) -> CandidateConfig {
        let content = format!("# {}\n{}", marker, site_conf("example.com", true, true));
        self.candidate(&[("example.com.conf", content)])
    }

    pub fn live_file(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.state.config.live_conf_dir.join(name)).ok()
    }
}
