use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::CommandTemplate;

/// Global configuration for the configuration manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server and persistence settings
    #[serde(default)]
    pub server: ServerConfig,

    /// How the supervised nginx process is checked and reloaded
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Knobs that shape the rendered nginx.conf
    #[serde(default)]
    pub render: RenderOptions,

    /// Apply pipeline tuning
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Certificate lifecycle settings
    #[serde(default)]
    pub certificates: CertificateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the API (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 3000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// SQLite database file holding the entity store
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// The active configuration artifact that nginx loads
    #[serde(default = "default_nginx_config_path")]
    pub config_path: String,

    /// Directory for candidate configurations under validation.
    /// Defaults to a hidden directory next to the active artifact.
    pub staging_dir: Option<String>,

    /// Syntax-check command; `{config}` is replaced by the candidate path
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Reload command; `{config}` is replaced by the active path
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Master process pid file, used to confirm the process survived a reload
    #[serde(default = "default_nginx_pid_file")]
    pub pid_file: Option<String>,

    /// stub_status endpoint polled for acknowledgement and status
    #[serde(default = "default_status_url")]
    pub status_url: Option<String>,

    /// Bound on a single syntax check (default: 5)
    #[serde(default = "default_validate_timeout")]
    pub validate_timeout_secs: u64,

    /// Bound on reload plus acknowledgement (default: 10)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Interval between acknowledgement probes after a reload
    #[serde(default = "default_ack_poll_interval")]
    pub ack_poll_interval_ms: u64,
}

impl NginxConfig {
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.config_path)
    }

    /// Staging directory, falling back to `<config dir>/.balancer-studio-staging`
    pub fn staging_dir(&self) -> PathBuf {
        match &self.staging_dir {
            Some(dir) => PathBuf::from(dir),
            None => self
                .config_path()
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(".balancer-studio-staging"),
        }
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn ack_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ack_poll_interval_ms)
    }

    /// How long shutdown waits for an in-flight apply. A cancelled reload is
    /// followed by an uncancellable rollback reload, each bounded by the
    /// reload timeout.
    pub fn shutdown_drain(&self) -> Duration {
        self.reload_timeout() * 2 + Duration::from_secs(5)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.config_path.trim().is_empty() {
            errors.push("nginx.config_path must not be empty".to_string());
        }

        match CommandTemplate::parse(&self.test_command) {
            Ok(template) if !template.references_config() => errors.push(
                "nginx.test_command must reference the candidate file with {config}".to_string(),
            ),
            Ok(_) => {}
            Err(e) => errors.push(format!("nginx.test_command: {}", e)),
        }

        if let Err(e) = CommandTemplate::parse(&self.reload_command) {
            errors.push(format!("nginx.reload_command: {}", e));
        }

        if self.validate_timeout_secs == 0 {
            errors.push("nginx.validate_timeout_secs must be greater than 0".to_string());
        }
        if self.reload_timeout_secs == 0 {
            errors.push("nginx.reload_timeout_secs must be greater than 0".to_string());
        }
        if self.ack_poll_interval_ms == 0 {
            errors.push("nginx.ack_poll_interval_ms must be greater than 0".to_string());
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            config_path: default_nginx_config_path(),
            staging_dir: None,
            test_command: default_test_command(),
            reload_command: default_reload_command(),
            pid_file: default_nginx_pid_file(),
            status_url: default_status_url(),
            validate_timeout_secs: default_validate_timeout(),
            reload_timeout_secs: default_reload_timeout(),
            ack_poll_interval_ms: default_ack_poll_interval(),
        }
    }
}

/// Options that feed into rendering. They are part of the fingerprint input,
/// so changing any of them forces a new configuration on the next apply.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RenderOptions {
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Where issued certificates live, one directory per certificate id
    #[serde(default = "default_certificate_dir")]
    pub certificate_dir: String,

    /// Loopback listener for stub_status; `None` omits the status server
    #[serde(default = "default_status_listen")]
    pub status_listen: Option<String>,

    #[serde(default = "default_status_path")]
    pub status_path: String,

    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,

    /// Emitted as the top-level `pid` directive when set
    #[serde(default)]
    pub pid_file: Option<String>,
}

impl RenderOptions {
    fn validate(&self, errors: &mut Vec<String>) {
        if self.http_port == 0 {
            errors.push("render.http_port must be greater than 0".to_string());
        }
        if self.https_port == 0 {
            errors.push("render.https_port must be greater than 0".to_string());
        }
        if self.http_port == self.https_port {
            errors.push("render.http_port and render.https_port must differ".to_string());
        }
        if self.worker_connections == 0 {
            errors.push("render.worker_connections must be greater than 0".to_string());
        }
        if !self.status_path.starts_with('/') {
            errors.push("render.status_path must start with '/'".to_string());
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            certificate_dir: default_certificate_dir(),
            status_listen: default_status_listen(),
            status_path: default_status_path(),
            worker_connections: default_worker_connections(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplyConfig {
    /// Quiet period before a pending intent is honored (default: 500)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Reconcile the active file with the store once at startup
    #[serde(default = "default_true")]
    pub apply_on_startup: bool,
}

impl ApplyConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            apply_on_startup: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateConfig {
    /// Period of the expiry sweep (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl CertificateConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_database_path() -> String {
    "./data/balancer-studio.db".to_string()
}

fn default_nginx_config_path() -> String {
    "/etc/nginx/nginx.conf".to_string()
}

fn default_test_command() -> String {
    "nginx -t -q -c {config}".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload -c {config}".to_string()
}

fn default_nginx_pid_file() -> Option<String> {
    Some("/run/nginx.pid".to_string())
}

fn default_status_url() -> Option<String> {
    Some("http://127.0.0.1:8081/nginx_status".to_string())
}

fn default_validate_timeout() -> u64 {
    5
}

fn default_reload_timeout() -> u64 {
    10
}

fn default_ack_poll_interval() -> u64 {
    100
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_certificate_dir() -> String {
    "/etc/balancer-studio/certs".to_string()
}

fn default_status_listen() -> Option<String> {
    Some("127.0.0.1:8081".to_string())
}

fn default_status_path() -> String {
    "/nginx_status".to_string()
}

fn default_worker_connections() -> u32 {
    1024
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.certificates.sweep_interval_secs == 0 {
            errors.push("certificates.sweep_interval_secs must be greater than 0".to_string());
        }
        self.nginx.validate(&mut errors);
        self.render.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
