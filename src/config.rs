use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::TetherError;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
#[cfg(unix)]
const UNIX_SOCKET_PATH_LIMIT_BYTES: usize = 100;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub daemon: DaemonConfig,
    pub connector: ConnectorConfig,
    pub timeouts: Timeouts,
    pub mount: MountConfig,
    pub intercept: InterceptConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub executable: String,
    pub socket_path: String,
    pub elevate: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    pub executable: String,
    pub socket_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub socket_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub quit_wait_ms: u64,
    pub network_ready_attempts: u32,
    pub network_ready_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    pub helper: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct InterceptConfig {
    pub default_port: String,
    pub agent_image: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub context: String,
    pub namespace: String,
    pub kubeconfig: String,
    pub mapped_namespaces: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            daemon: DaemonConfig::default(),
            connector: ConnectorConfig::default(),
            timeouts: Timeouts::default(),
            mount: MountConfig::default(),
            intercept: InterceptConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            executable: "tether-daemon".to_string(),
            socket_path: "/var/run/tether-daemon.socket".to_string(),
            elevate: true,
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            executable: "tether-connector".to_string(),
            socket_path: String::new(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            socket_wait_ms: 10_000,
            poll_interval_ms: 100,
            quit_wait_ms: 5_000,
            network_ready_attempts: 40,
            network_ready_interval_ms: 250,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            helper: "sshfs".to_string(),
        }
    }
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            default_port: "8080".to_string(),
            agent_image: "tether/agent:latest".to_string(),
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn socket_wait_attempts(&self) -> u32 {
        attempts_for(self.socket_wait_ms, self.poll_interval_ms)
    }

    pub fn quit_wait_attempts(&self) -> u32 {
        attempts_for(self.quit_wait_ms, self.poll_interval_ms)
    }

    pub fn network_ready_interval(&self) -> Duration {
        Duration::from_millis(self.network_ready_interval_ms)
    }
}

fn attempts_for(total_ms: u64, interval_ms: u64) -> u32 {
    let interval_ms = interval_ms.max(1);
    u32::try_from(total_ms.div_ceil(interval_ms))
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Cluster selection flags, merged from the config file and the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeFlags {
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub kubeconfig: Option<String>,
    pub mapped_namespaces: Vec<String>,
}

impl KubeFlags {
    pub fn from_config(cfg: &ClusterConfig) -> Self {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        Self {
            context: non_empty(&cfg.context),
            namespace: non_empty(&cfg.namespace),
            kubeconfig: non_empty(&cfg.kubeconfig).map(|path| expand_path(&path)),
            mapped_namespaces: cfg.mapped_namespaces.clone(),
        }
    }

    /// Command-line values win over configured ones.
    pub fn merged(mut self, overrides: KubeFlags) -> Self {
        if overrides.context.is_some() {
            self.context = overrides.context;
        }
        if overrides.namespace.is_some() {
            self.namespace = overrides.namespace;
        }
        if overrides.kubeconfig.is_some() {
            self.kubeconfig = overrides.kubeconfig;
        }
        if !overrides.mapped_namespaces.is_empty() {
            self.mapped_namespaces = overrides.mapped_namespaces;
        }
        self
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut flags = BTreeMap::new();
        if let Some(context) = &self.context {
            flags.insert("context".to_string(), context.clone());
        }
        if let Some(namespace) = &self.namespace {
            flags.insert("namespace".to_string(), namespace.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            flags.insert("kubeconfig".to_string(), kubeconfig.clone());
        }
        flags
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("TETHER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("tether");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("TETHER_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn read_config_from_str(content: &str) -> Result<Config, TetherError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(TetherError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, TetherError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Missing config files mean defaults.
pub fn load_config(path: &Path) -> Result<Config, TetherError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path)
}

pub fn validate_config(cfg: &Config) -> Result<(), TetherError> {
    if cfg.daemon.executable.trim().is_empty() {
        return Err(TetherError::Config(
            "daemon.executable must be non-empty".to_string(),
        ));
    }
    if cfg.connector.executable.trim().is_empty() {
        return Err(TetherError::Config(
            "connector.executable must be non-empty".to_string(),
        ));
    }
    if cfg.daemon.socket_path.trim().is_empty() {
        return Err(TetherError::Config(
            "daemon.socket_path must be non-empty".to_string(),
        ));
    }
    for (field, value) in [
        ("timeouts.socket_wait_ms", cfg.timeouts.socket_wait_ms),
        ("timeouts.poll_interval_ms", cfg.timeouts.poll_interval_ms),
        ("timeouts.quit_wait_ms", cfg.timeouts.quit_wait_ms),
        (
            "timeouts.network_ready_interval_ms",
            cfg.timeouts.network_ready_interval_ms,
        ),
    ] {
        if value == 0 {
            return Err(TetherError::Config(format!(
                "{field} must be greater than 0"
            )));
        }
    }
    if cfg.timeouts.network_ready_attempts == 0 {
        return Err(TetherError::Config(
            "timeouts.network_ready_attempts must be greater than 0".to_string(),
        ));
    }
    if cfg.mount.helper.trim().is_empty() {
        return Err(TetherError::Config(
            "mount.helper must be non-empty".to_string(),
        ));
    }
    if cfg.intercept.agent_image.trim().is_empty() {
        return Err(TetherError::Config(
            "intercept.agent_image must be non-empty".to_string(),
        ));
    }
    #[cfg(unix)]
    {
        for (field, configured) in [
            ("daemon.socket_path", cfg.daemon.socket_path.trim()),
            ("connector.socket_path", cfg.connector.socket_path.trim()),
        ] {
            if configured.is_empty() {
                continue;
            }
            let expanded = PathBuf::from(expand_path(configured));
            if unix_socket_path_too_long(&expanded) {
                return Err(TetherError::Config(format!(
                    "{field} is too long for unix sockets ({} bytes); set a shorter path",
                    expanded.as_os_str().as_bytes().len()
                )));
            }
        }
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

#[cfg(unix)]
fn unix_socket_path_too_long(path: &Path) -> bool {
    path.as_os_str().as_bytes().len() >= UNIX_SOCKET_PATH_LIMIT_BYTES
}

pub fn daemon_socket_path(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(cfg.daemon.socket_path.trim()))
}

/// The connector runs as the invoking user, so its socket lives in a per-user
/// directory unless configured otherwise.
pub fn connector_socket_path(cfg: &Config, config_dir: &Path) -> PathBuf {
    let configured = cfg.connector.socket_path.trim();
    if !configured.is_empty() {
        return PathBuf::from(expand_path(configured));
    }
    let preferred = dirs::runtime_dir()
        .unwrap_or_else(|| config_dir.to_path_buf())
        .join("tether-connector.socket");
    #[cfg(unix)]
    {
        if unix_socket_path_too_long(&preferred) {
            return env::temp_dir().join(format!("tether-connector-{}.socket", current_uid()));
        }
    }
    preferred
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn ingress_cache_path() -> PathBuf {
    if let Ok(path) = env::var("TETHER_CACHE_DIR") {
        return PathBuf::from(path).join("ingress.json");
    }
    dirs::cache_dir()
        .unwrap_or_else(default_config_dir)
        .join("tether")
        .join("ingress.json")
}

pub fn ensure_parent(path: &Path) -> Result<(), TetherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Replace `path` in one step so readers never observe a partial write.
pub fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), TetherError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "tether".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
