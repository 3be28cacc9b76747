use crate::{Result, ShiftError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShiftConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub balloon: BalloonConfig,
    #[serde(default)]
    pub barrier: BarrierConfig,
    #[serde(default)]
    pub start: StartConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Libvirt,
    Simulated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Libvirt => "libvirt",
            BackendKind::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name of this host as other cluster members address it.
    #[serde(default = "default_host_name")]
    pub name: String,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Hypervisor URI for the local host.
    #[serde(default = "default_local_uri")]
    pub uri: String,
    /// URI used to reach another host; `{driver}`, `{transport}` and `{host}` are substituted.
    #[serde(default = "default_remote_uri_template")]
    pub remote_uri_template: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            backend: default_backend(),
            uri: default_local_uri(),
            remote_uri_template: default_remote_uri_template(),
        }
    }
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_backend() -> BackendKind {
    BackendKind::Libvirt
}

fn default_local_uri() -> String {
    "qemu:///system".to_string()
}

fn default_remote_uri_template() -> String {
    "{driver}+{transport}://{host}/system".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_rdma_uri_template")]
    pub rdma_uri_template: String,
    #[serde(default = "default_driver")]
    pub default_driver: String,
    #[serde(default = "default_transport")]
    pub default_transport: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            rdma_uri_template: default_rdma_uri_template(),
            default_driver: default_driver(),
            default_transport: default_transport(),
        }
    }
}

fn default_rdma_uri_template() -> String {
    "rdma://{host}-ib".to_string()
}

fn default_driver() -> String {
    "qemu".to_string()
}

fn default_transport() -> String {
    "ssh".to_string()
}

/// Tunables for the adaptive balloon wait. None of these are load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalloonConfig {
    #[serde(default = "default_headroom_percent")]
    pub headroom_percent: u64,
    #[serde(default = "default_page_size_kib")]
    pub page_size_kib: u64,
    #[serde(default = "default_resize_timeout_ms")]
    pub resize_timeout_ms: u64,
    #[serde(default = "default_confirm_window_ms")]
    pub confirm_window_ms: u64,
    #[serde(default = "default_confirm_poll_ms")]
    pub confirm_poll_ms: u64,
}

impl Default for BalloonConfig {
    fn default() -> Self {
        Self {
            headroom_percent: default_headroom_percent(),
            page_size_kib: default_page_size_kib(),
            resize_timeout_ms: default_resize_timeout_ms(),
            confirm_window_ms: default_confirm_window_ms(),
            confirm_poll_ms: default_confirm_poll_ms(),
        }
    }
}

impl BalloonConfig {
    pub fn resize_timeout(&self) -> Duration {
        Duration::from_millis(self.resize_timeout_ms)
    }

    pub fn confirm_window(&self) -> Duration {
        Duration::from_millis(self.confirm_window_ms)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms.max(1))
    }
}

fn default_headroom_percent() -> u64 {
    5
}

fn default_page_size_kib() -> u64 {
    4
}

fn default_resize_timeout_ms() -> u64 {
    60_000
}

fn default_confirm_window_ms() -> u64 {
    1000
}

fn default_confirm_poll_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierConfig {
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            qos: default_qos(),
            ack_timeout_ms: default_ack_timeout_ms(),
            request_topic: default_request_topic(),
            response_topic: default_response_topic(),
        }
    }
}

impl BarrierConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn request_topic_for(&self, vm_name: &str) -> String {
        self.request_topic.replace("{vm}", vm_name)
    }

    pub fn response_topic_for(&self, vm_name: &str) -> String {
        self.response_topic.replace("{vm}", vm_name)
    }
}

fn default_qos() -> u8 {
    2
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_request_topic() -> String {
    "{vm}/suspend/request".to_string()
}

fn default_response_topic() -> String {
    "{vm}/suspend/response".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_memory_stats_period_secs")]
    pub memory_stats_period_secs: u32,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: default_readiness_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            memory_stats_period_secs: default_memory_stats_period_secs(),
        }
    }
}

impl StartConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_readiness_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_memory_stats_period_secs() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StopConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Nodes probed before starting a domain. This host is skipped.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_true")]
    pub check_remote: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            check_remote: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_task_topic")]
    pub task_topic: String,
    #[serde(default = "default_result_topic")]
    pub result_topic: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            task_topic: default_task_topic(),
            result_topic: default_result_topic(),
        }
    }
}

fn default_task_topic() -> String {
    "vmshift/tasks".to_string()
}

fn default_result_topic() -> String {
    "vmshift/results".to_string()
}

impl ShiftConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ShiftConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ShiftError::Config(e.to_string()))
    }

    /// `<config dir>/vmshift/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmshift").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.balloon.page_size_kib == 0 {
            return Err(ShiftError::Config(
                "balloon.page_size_kib must be non-zero".to_string(),
            ));
        }
        if self.balloon.headroom_percent > 100 {
            return Err(ShiftError::Config(
                "balloon.headroom_percent must be at most 100".to_string(),
            ));
        }
        if self.barrier.qos > 2 {
            return Err(ShiftError::Config(format!(
                "barrier.qos must be 0, 1 or 2 (got {})",
                self.barrier.qos
            )));
        }
        Ok(())
    }

    /// Hypervisor URI of another host.
    pub fn remote_uri(&self, host: &str, driver: &str, transport: &str) -> String {
        self.host
            .remote_uri_template
            .replace("{driver}", driver)
            .replace("{transport}", transport)
            .replace("{host}", host)
    }

    pub fn rdma_uri(&self, host: &str) -> String {
        self.migration.rdma_uri_template.replace("{host}", host)
    }
}
