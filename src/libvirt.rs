//! Hypervisor backend driving libvirt through the `virsh` command line.

use crate::{
    Result, ShiftError,
    config::ShiftConfig,
    hypervisor::{
        BalloonCallback, Connection, DeviceBackend, Domain, DomainInfo, DomainState,
        HypervisorBackend, MemoryStats, MigrationFlags, SizeScope, SubscriptionHandle,
        domain_name_from_xml,
    },
    log_debug, log_error, log_info, log_warn,
    pci::PciId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct VirshBackend {
    config: Arc<ShiftConfig>,
    next_handle: AtomicU64,
    /// Event readers, one `virsh event --loop` child each.
    watchers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl VirshBackend {
    pub fn new(config: Arc<ShiftConfig>) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_available() -> bool {
        std::process::Command::new("virsh")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn virsh(&self, uri: &str, args: &[&str]) -> Result<String> {
        log_debug!("virsh -c {} {}", uri, args.join(" "));
        let output = Command::new("virsh")
            .arg("-c")
            .arg(uri)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                log_error!("Failed to run virsh: {}", e);
                ShiftError::Io(e)
            })?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(ShiftError::backend(clean_error(&error)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn on_domain(&self, domain: &Domain, args: &[&str]) -> Result<String> {
        self.virsh(&domain.uri, args).await
    }

    /// Write `xml` to a temporary file for the duration of `f`.
    async fn with_xml_file<T, F, Fut>(&self, prefix: &str, xml: &str, f: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let path = std::env::temp_dir().join(format!("vmshift-{}-{}.xml", prefix, Uuid::new_v4()));
        tokio::fs::write(&path, xml).await?;
        let result = f(path.clone()).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log_warn!("Failed to remove {}: {}", path.display(), e);
        }
        result
    }
}

/// Strip the `error: ` prefixes virsh puts in front of every stderr line.
fn clean_error(stderr: &str) -> String {
    stderr
        .lines()
        .map(|line| line.trim().trim_start_matches("error:").trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(": ")
}

fn is_not_found(err: &ShiftError) -> bool {
    matches!(err, ShiftError::Backend(msg)
        if msg.contains("failed to get domain") || msg.contains("Domain not found"))
}

/// Arguments of `virsh migrate`. RDMA is selected by the `rdma://` migrate
/// URI alone, no extra flag is passed for it.
fn migrate_args<'a>(
    name: &'a str,
    destination_uri: &'a str,
    flags: MigrationFlags,
    migrate_uri: Option<&'a str>,
) -> Vec<&'a str> {
    let mut args = vec!["migrate"];
    if flags.live {
        args.push("--live");
    }
    args.push(name);
    args.push(destination_uri);
    if let Some(uri) = migrate_uri {
        args.push("--migrateuri");
        args.push(uri);
    }
    args
}

pub(crate) fn parse_state(text: &str) -> DomainState {
    match text.trim() {
        "running" => DomainState::Running,
        "shut off" => DomainState::ShutOff,
        other => DomainState::Other(other.to_string()),
    }
}

fn parse_kib(value: &str) -> Option<u64> {
    value.trim().trim_end_matches("KiB").trim().parse().ok()
}

/// Parse `virsh dominfo` output.
pub(crate) fn parse_dominfo(output: &str) -> Result<DomainInfo> {
    let mut state = None;
    let mut memory = None;
    let mut max_memory = None;
    let mut vcpus = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "State" => state = Some(parse_state(value)),
            "Used memory" => memory = parse_kib(value),
            "Max memory" => max_memory = parse_kib(value),
            "CPU(s)" => vcpus = value.trim().parse().ok(),
            _ => {}
        }
    }
    match (state, memory, max_memory, vcpus) {
        (Some(state), Some(memory_kib), Some(max_memory_kib), Some(vcpus)) => Ok(DomainInfo {
            state,
            memory_kib,
            max_memory_kib,
            vcpus,
        }),
        _ => Err(ShiftError::backend(format!(
            "unexpected dominfo output: {}",
            output.trim()
        ))),
    }
}

/// Parse `virsh dommemstat` output.
pub(crate) fn parse_memstat(output: &str) -> MemoryStats {
    let mut stats = MemoryStats::default();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(tag), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse() else {
            continue;
        };
        match tag {
            "actual" => stats.actual = value,
            "unused" => stats.unused = value,
            "available" => stats.available = value,
            _ => {}
        }
    }
    stats
}

/// First IPv4 address reported by `virsh domifaddr`.
pub(crate) fn parse_ipv4(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "ipv4" {
                return fields
                    .next()
                    .map(|addr| addr.split('/').next().unwrap_or(addr).to_string());
            }
        }
        None
    })
}

/// Balloon value of one `virsh event` line, e.g.
/// `event 'balloon-change' for domain 'vm1': 1048576KiB`.
pub(crate) fn parse_balloon_event(line: &str) -> Option<u64> {
    if !line.contains("balloon-change") {
        return None;
    }
    let (_, value) = line.rsplit_once(':')?;
    parse_kib(value)
}

#[async_trait]
impl HypervisorBackend for VirshBackend {
    fn host_name(&self) -> &str {
        &self.config.host.name
    }

    async fn find_domain(&self, name: &str) -> Result<Domain> {
        let uri = &self.config.host.uri;
        match self.virsh(uri, &["domstate", name]).await {
            Ok(_) => Ok(Domain::new(name, self.host_name(), uri.as_str())),
            Err(e) if is_not_found(&e) => Err(ShiftError::DomainNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn define_domain(&self, xml: &str) -> Result<Domain> {
        let name = domain_name_from_xml(xml)
            .ok_or_else(|| ShiftError::MalformedRequest("domain XML has no <name>".to_string()))?;
        let uri = self.config.host.uri.clone();
        self.with_xml_file("domain", xml, |path| async move {
            let path = path.to_string_lossy().into_owned();
            self.virsh(&uri, &["define", &path]).await
        })
        .await?;
        log_info!("Defined domain {}", name);
        Ok(Domain::new(name, self.host_name(), self.config.host.uri.as_str()))
    }

    async fn domain_info(&self, domain: &Domain) -> Result<DomainInfo> {
        let output = self.on_domain(domain, &["dominfo", &domain.name]).await?;
        parse_dominfo(&output)
    }

    async fn domain_state(&self, domain: &Domain) -> Result<DomainState> {
        let output = self.on_domain(domain, &["domstate", &domain.name]).await?;
        Ok(parse_state(&output))
    }

    async fn set_memory(&self, domain: &Domain, kib: u64, scope: SizeScope) -> Result<()> {
        let command = match scope {
            SizeScope::Maximum => "setmaxmem",
            SizeScope::Current => "setmem",
        };
        let size = format!("{}KiB", kib);
        self.on_domain(domain, &[command, &domain.name, &size, "--config"])
            .await?;
        Ok(())
    }

    async fn set_vcpus(&self, domain: &Domain, count: u32, scope: SizeScope) -> Result<()> {
        let count = count.to_string();
        let mut args = vec!["setvcpus", domain.name.as_str(), count.as_str(), "--config"];
        if scope == SizeScope::Maximum {
            args.push("--maximum");
        }
        self.on_domain(domain, &args).await?;
        Ok(())
    }

    async fn set_memory_stats_period(&self, domain: &Domain, seconds: u32) -> Result<()> {
        let period = seconds.to_string();
        self.on_domain(domain, &["dommemstat", &domain.name, "--period", &period, "--config"])
            .await?;
        Ok(())
    }

    async fn create(&self, domain: &Domain) -> Result<()> {
        self.on_domain(domain, &["start", &domain.name]).await?;
        Ok(())
    }

    async fn destroy(&self, domain: &Domain) -> Result<()> {
        self.on_domain(domain, &["destroy", &domain.name]).await?;
        Ok(())
    }

    async fn shutdown(&self, domain: &Domain) -> Result<()> {
        self.on_domain(domain, &["shutdown", &domain.name]).await?;
        Ok(())
    }

    async fn guest_reachable(&self, domain: &Domain) -> Result<bool> {
        let output = match self
            .on_domain(domain, &["domifaddr", &domain.name, "--source", "agent"])
            .await
        {
            Ok(output) => output,
            Err(_) => self.on_domain(domain, &["domifaddr", &domain.name]).await?,
        };
        let Some(address) = parse_ipv4(&output) else {
            return Ok(false);
        };
        let ping = Command::new("ping")
            .args(["-c", "1", "-W", "1", &address])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(ping.success())
    }

    async fn connect(&self, host: &str, driver: &str, transport: &str) -> Result<Connection> {
        let uri = self.config.remote_uri(host, driver, transport);
        self.virsh(&uri, &["uri"])
            .await
            .map_err(|e| ShiftError::backend(format!("Cannot establish connection to {}: {}", host, e)))?;
        Ok(Connection {
            host: host.to_string(),
            uri,
        })
    }

    async fn remote_domain_state(
        &self,
        connection: &Connection,
        name: &str,
    ) -> Result<Option<DomainState>> {
        match self.virsh(&connection.uri, &["domstate", name]).await {
            Ok(output) => Ok(Some(parse_state(&output))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn migrate(
        &self,
        domain: &Domain,
        destination: &Connection,
        flags: MigrationFlags,
        migrate_uri: Option<&str>,
    ) -> Result<Domain> {
        let args = migrate_args(&domain.name, &destination.uri, flags, migrate_uri);
        self.on_domain(domain, &args).await.map_err(|e| match e {
            ShiftError::Backend(msg) => ShiftError::MigrationFailed(msg),
            other => other,
        })?;
        Ok(Domain::new(
            domain.name.clone(),
            destination.host.clone(),
            destination.uri.clone(),
        ))
    }

    async fn balloon_stats(&self, domain: &Domain) -> Result<MemoryStats> {
        let output = self.on_domain(domain, &["dommemstat", &domain.name]).await?;
        Ok(parse_memstat(&output))
    }

    async fn set_balloon(&self, domain: &Domain, kib: u64) -> Result<()> {
        let size = format!("{}KiB", kib);
        self.on_domain(domain, &["setmem", &domain.name, &size, "--live"])
            .await?;
        Ok(())
    }

    async fn subscribe_balloon_change(
        &self,
        domain: &Domain,
        callback: BalloonCallback,
    ) -> Result<SubscriptionHandle> {
        let mut child = Command::new("virsh")
            .args([
                "-c",
                domain.uri.as_str(),
                "event",
                "--domain",
                domain.name.as_str(),
                "--event",
                "balloon-change",
                "--loop",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShiftError::backend("virsh event has no stdout"))?;

        let name = domain.name.clone();
        let reader = tokio::spawn(async move {
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(value) = parse_balloon_event(&line) {
                    log_debug!("balloon-change {} -> {} KiB", name, value);
                    callback(value);
                }
            }
        });

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.watchers.lock().unwrap().insert(handle, reader);
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some(reader) = self.watchers.lock().unwrap().remove(&handle.0) {
            // Dropping the reader kills its `virsh event` child.
            reader.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBackend for VirshBackend {
    async fn attach(&self, domain: &Domain, device: &PciId) -> Result<()> {
        self.with_xml_file("hostdev", &device.hostdev_xml(), |path| async move {
            let path = path.to_string_lossy().into_owned();
            self.on_domain(domain, &["attach-device", &domain.name, &path, "--live"])
                .await
        })
        .await?;
        log_debug!("Attached {} to {}", device, domain);
        Ok(())
    }

    async fn detach(&self, domain: &Domain) -> Result<Vec<PciId>> {
        let xml = self.on_domain(domain, &["dumpxml", &domain.name]).await?;
        let mut detached = Vec::new();
        for device in PciId::from_domain_xml(&xml) {
            let result = self
                .with_xml_file("hostdev", &device.hostdev_xml(), |path| async move {
                    let path = path.to_string_lossy().into_owned();
                    self.on_domain(domain, &["detach-device", &domain.name, &path, "--live"])
                        .await
                })
                .await;
            match result {
                Ok(_) => detached.push(device),
                Err(e) => log_error!("Failed to detach {} from {}: {}", device, domain, e),
            }
        }
        Ok(detached)
    }
}
