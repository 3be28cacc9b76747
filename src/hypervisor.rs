use crate::{Result, pci::PciId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Handle to a domain on a specific host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub host: String,
    /// Hypervisor URI the handle was resolved through.
    pub uri: String,
}

impl Domain {
    pub fn new(name: impl Into<String>, host: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            uri: uri.into(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

/// Text of the top-level `<name>` element of a domain definition.
pub fn domain_name_from_xml(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")?;
    let name = xml[start..start + end].trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    ShutOff,
    Running,
    Other(String),
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::ShutOff => write!(f, "shut off"),
            DomainState::Running => write!(f, "running"),
            DomainState::Other(state) => write!(f, "{}", state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub memory_kib: u64,
    pub max_memory_kib: u64,
    pub vcpus: u32,
}

/// Balloon statistics as reported by the guest driver, all in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub unused: u64,
    pub available: u64,
    pub actual: u64,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unused: {}, available: {}, actual: {}",
            self.unused, self.available, self.actual
        )
    }
}

/// Which value a sizing call targets in the persistent domain config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeScope {
    Current,
    Maximum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationFlags {
    /// Keep the guest running during transfer. Cold migration may pause it.
    pub live: bool,
    pub rdma: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Invoked with the new balloon size in KiB on every balloon change event.
pub type BalloonCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Hypervisor control surface consumed by the migration protocol.
///
/// Implementations are shared across concurrently executing tasks and are
/// expected to serialize access to the underlying connection themselves.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    /// Name of the host this backend controls.
    fn host_name(&self) -> &str;

    /// Fails with `ShiftError::DomainNotFound` when no such domain exists.
    async fn find_domain(&self, name: &str) -> Result<Domain>;

    async fn define_domain(&self, xml: &str) -> Result<Domain>;

    async fn domain_info(&self, domain: &Domain) -> Result<DomainInfo>;

    async fn domain_state(&self, domain: &Domain) -> Result<DomainState> {
        Ok(self.domain_info(domain).await?.state)
    }

    async fn set_memory(&self, domain: &Domain, kib: u64, scope: SizeScope) -> Result<()>;

    async fn set_vcpus(&self, domain: &Domain, count: u32, scope: SizeScope) -> Result<()>;

    async fn set_memory_stats_period(&self, domain: &Domain, seconds: u32) -> Result<()>;

    async fn create(&self, domain: &Domain) -> Result<()>;

    async fn destroy(&self, domain: &Domain) -> Result<()>;

    async fn shutdown(&self, domain: &Domain) -> Result<()>;

    /// Readiness probe: true once the guest answers on its network interface.
    async fn guest_reachable(&self, domain: &Domain) -> Result<bool>;

    async fn connect(&self, host: &str, driver: &str, transport: &str) -> Result<Connection>;

    /// State of `name` on a remote node, `None` when the node does not know it.
    async fn remote_domain_state(
        &self,
        connection: &Connection,
        name: &str,
    ) -> Result<Option<DomainState>>;

    /// Migrate `domain` to `destination`, returning the handle on the destination.
    async fn migrate(
        &self,
        domain: &Domain,
        destination: &Connection,
        flags: MigrationFlags,
        migrate_uri: Option<&str>,
    ) -> Result<Domain>;

    async fn balloon_stats(&self, domain: &Domain) -> Result<MemoryStats>;

    async fn set_balloon(&self, domain: &Domain, kib: u64) -> Result<()>;

    async fn subscribe_balloon_change(
        &self,
        domain: &Domain,
        callback: BalloonCallback,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

/// PCI passthrough attachment for a running domain.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn attach(&self, domain: &Domain, device: &PciId) -> Result<()>;

    /// Detach every passthrough device, returning them in attachment order.
    async fn detach(&self, domain: &Domain) -> Result<Vec<PciId>>;
}
