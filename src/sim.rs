//! In-process simulated cluster.
//!
//! Every host shares one state table, so a domain migrated from `node01`
//! shows up on `node02`. All backend calls that change something are
//! appended to a call log which tests inspect to check ordering and
//! exactly-once guarantees. The balloon is driven by a background task that
//! steps towards the requested size and fires change notifications, like a
//! guest balloon driver would.

use crate::{
    Result, ShiftError,
    hypervisor::{
        BalloonCallback, Connection, DeviceBackend, Domain, DomainInfo, DomainState,
        HypervisorBackend, MemoryStats, MigrationFlags, SizeScope, SubscriptionHandle,
        domain_name_from_xml,
    },
    log_debug,
    pci::PciId,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Define,
    SetMemory,
    SetVcpus,
    Create,
    Destroy,
    Shutdown,
    Connect,
    Migrate,
    BalloonStats,
    SetBalloon,
    Attach,
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Define(String),
    SetMemory {
        domain: Domain,
        kib: u64,
        scope: SizeScope,
    },
    SetVcpus {
        domain: Domain,
        count: u32,
        scope: SizeScope,
    },
    Create(Domain),
    Destroy(Domain),
    Shutdown(Domain),
    Connect(String),
    Migrate {
        domain: Domain,
        destination: String,
        flags: MigrationFlags,
        migrate_uri: Option<String>,
    },
    SetBalloon {
        domain: Domain,
        kib: u64,
    },
    Subscribe(Domain),
    Unsubscribe(SubscriptionHandle),
    Attach {
        domain: Domain,
        device: PciId,
    },
    Detach(Domain),
}

/// Behaviour knobs for the simulated balloon and guest.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Number of change events emitted per resize. Zero freezes the balloon.
    pub balloon_steps: u32,
    pub balloon_step_interval: Duration,
    /// Offset between the requested and the final balloon size.
    pub balloon_rounding_kib: i64,
    /// Whether balloon steps are announced to subscribers.
    pub balloon_events: bool,
    /// Failed readiness probes after boot before the guest answers.
    pub probes_until_reachable: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            balloon_steps: 4,
            balloon_step_interval: Duration::from_millis(5),
            balloon_rounding_kib: 0,
            balloon_events: true,
            probes_until_reachable: 1,
        }
    }
}

/// Initial shape of a simulated domain.
#[derive(Debug, Clone)]
pub struct SimDomainSpec {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub used_kib: u64,
    pub vcpus: u32,
    pub devices: Vec<PciId>,
}

impl SimDomainSpec {
    pub fn shut_off(max_memory_kib: u64) -> Self {
        Self {
            state: DomainState::ShutOff,
            max_memory_kib,
            used_kib: max_memory_kib / 4,
            vcpus: 1,
            devices: Vec::new(),
        }
    }

    pub fn running(max_memory_kib: u64, used_kib: u64) -> Self {
        Self {
            state: DomainState::Running,
            max_memory_kib,
            used_kib,
            vcpus: 1,
            devices: Vec::new(),
        }
    }

    pub fn with_devices(mut self, devices: Vec<PciId>) -> Self {
        self.devices = devices;
        self
    }
}

/// Observable state of a simulated domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDomain {
    pub state: DomainState,
    pub memory_kib: u64,
    pub max_memory_kib: u64,
    pub vcpus: u32,
    pub max_vcpus: u32,
    pub balloon_kib: u64,
    pub used_kib: u64,
    pub devices: Vec<PciId>,
    pub stats_period: u32,
    probes_left: u32,
}

#[derive(Default)]
struct ClusterState {
    domains: HashMap<(String, String), SimDomain>,
    unreachable_hosts: HashSet<String>,
    calls: Vec<Call>,
    subscriptions: HashMap<u64, (Domain, BalloonCallback)>,
    next_handle: u64,
    failures: HashMap<SimOp, String>,
    resize_generation: HashMap<(String, String), u64>,
}

#[derive(Clone)]
pub struct SimulatedCluster {
    local_host: String,
    options: SimOptions,
    state: Arc<Mutex<ClusterState>>,
}

impl SimulatedCluster {
    pub fn new(local_host: &str) -> Self {
        Self::with_options(local_host, SimOptions::default())
    }

    pub fn with_options(local_host: &str, options: SimOptions) -> Self {
        Self {
            local_host: local_host.to_string(),
            options,
            state: Arc::new(Mutex::new(ClusterState::default())),
        }
    }

    /// Another host's view of the same cluster.
    pub fn on_host(&self, host: &str) -> Self {
        Self {
            local_host: host.to_string(),
            options: self.options.clone(),
            state: self.state.clone(),
        }
    }

    pub fn add_domain(&self, host: &str, name: &str, spec: SimDomainSpec) {
        let running = spec.state == DomainState::Running;
        let domain = SimDomain {
            state: spec.state,
            memory_kib: spec.max_memory_kib,
            max_memory_kib: spec.max_memory_kib,
            vcpus: spec.vcpus,
            max_vcpus: spec.vcpus,
            balloon_kib: spec.max_memory_kib,
            used_kib: spec.used_kib,
            devices: spec.devices,
            stats_period: 0,
            probes_left: if running { 0 } else { self.options.probes_until_reachable },
        };
        let mut state = self.state.lock().unwrap();
        state
            .domains
            .insert((host.to_string(), name.to_string()), domain);
    }

    pub fn domain(&self, host: &str, name: &str) -> Option<SimDomain> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .get(&(host.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        if reachable {
            state.unreachable_hosts.remove(host);
        } else {
            state.unreachable_hosts.insert(host.to_string());
        }
    }

    /// Make every subsequent `op` fail with `message`.
    pub fn fail(&self, op: SimOp, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(op, message.to_string());
    }

    pub fn clear_failure(&self, op: SimOp) {
        let mut state = self.state.lock().unwrap();
        state.failures.remove(&op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    fn handle(&self, name: &str) -> Domain {
        Domain::new(name, &self.local_host, self.uri_for(&self.local_host))
    }

    fn uri_for(&self, host: &str) -> String {
        format!("sim://{}/system", host)
    }

    fn check_failure(state: &ClusterState, op: SimOp) -> Result<()> {
        match state.failures.get(&op) {
            Some(message) => Err(ShiftError::backend(message.clone())),
            None => Ok(()),
        }
    }

    /// Record a call and fail it if a failure is injected for `op`.
    fn record(&self, op: SimOp, call: Call) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        Self::check_failure(&state, op)
    }

    fn with_domain<T>(
        &self,
        domain: &Domain,
        f: impl FnOnce(&mut SimDomain) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let key = (domain.host.clone(), domain.name.clone());
        match state.domains.get_mut(&key) {
            Some(sim) => f(sim),
            None => Err(ShiftError::DomainNotFound(domain.name.clone())),
        }
    }

    fn move_domain(&self, domain: &Domain, destination: &Connection) -> Result<Domain> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable_hosts.contains(&destination.host) {
            return Err(ShiftError::backend(format!(
                "unable to connect to server at '{}'",
                destination.host
            )));
        }
        let dest_key = (destination.host.clone(), domain.name.clone());
        if state.domains.contains_key(&dest_key) {
            return Err(ShiftError::backend(format!(
                "operation failed: domain '{}' already exists on {}",
                domain.name, destination.host
            )));
        }
        let source_key = (domain.host.clone(), domain.name.clone());
        let mut sim = state
            .domains
            .remove(&source_key)
            .ok_or_else(|| ShiftError::DomainNotFound(domain.name.clone()))?;
        sim.state = DomainState::Running;
        state.domains.insert(dest_key, sim);

        Ok(Domain::new(
            domain.name.clone(),
            destination.host.clone(),
            destination.uri.clone(),
        ))
    }

    fn spawn_balloon(&self, domain: Domain, from: u64, target: u64) {
        let steps = self.options.balloon_steps;
        if steps == 0 {
            return;
        }
        let interval = self.options.balloon_step_interval;
        let announce = self.options.balloon_events;
        let final_value = (target as i64 + self.options.balloon_rounding_kib).max(0) as u64;
        let key = (domain.host.clone(), domain.name.clone());

        let generation = {
            let mut state = self.state.lock().unwrap();
            let entry = state.resize_generation.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            for step in 1..=steps as u64 {
                tokio::time::sleep(interval).await;
                let value = if step == steps as u64 {
                    final_value
                } else if final_value >= from {
                    from + (final_value - from) * step / steps as u64
                } else {
                    from - (from - final_value) * step / steps as u64
                };

                let callbacks: Vec<BalloonCallback> = {
                    let mut state = state.lock().unwrap();
                    // A newer resize supersedes this one.
                    if state.resize_generation.get(&key) != Some(&generation) {
                        return;
                    }
                    match state.domains.get_mut(&key) {
                        Some(sim) => sim.balloon_kib = value,
                        None => return,
                    }
                    if !announce {
                        continue;
                    }
                    state
                        .subscriptions
                        .values()
                        .filter(|(d, _)| d.host == key.0 && d.name == key.1)
                        .map(|(_, cb)| cb.clone())
                        .collect()
                };

                log_debug!("sim balloon {}/{} -> {} KiB", key.0, key.1, value);
                for callback in callbacks {
                    callback(value);
                }
            }
        });
    }
}

#[async_trait]
impl HypervisorBackend for SimulatedCluster {
    fn host_name(&self) -> &str {
        &self.local_host
    }

    async fn find_domain(&self, name: &str) -> Result<Domain> {
        let state = self.state.lock().unwrap();
        if state
            .domains
            .contains_key(&(self.local_host.clone(), name.to_string()))
        {
            Ok(self.handle(name))
        } else {
            Err(ShiftError::DomainNotFound(name.to_string()))
        }
    }

    async fn define_domain(&self, xml: &str) -> Result<Domain> {
        self.record(SimOp::Define, Call::Define(xml.to_string()))?;
        let name = domain_name_from_xml(xml)
            .ok_or_else(|| ShiftError::backend("XML error: missing domain name"))?;

        let exists = self
            .state
            .lock()
            .unwrap()
            .domains
            .contains_key(&(self.local_host.clone(), name.clone()));
        if !exists {
            self.add_domain(&self.local_host, &name, SimDomainSpec::shut_off(1024 * 1024));
        }
        Ok(self.handle(&name))
    }

    async fn domain_info(&self, domain: &Domain) -> Result<DomainInfo> {
        self.with_domain(domain, |sim| {
            Ok(DomainInfo {
                state: sim.state.clone(),
                memory_kib: sim.memory_kib,
                max_memory_kib: sim.max_memory_kib,
                vcpus: sim.vcpus,
            })
        })
    }

    async fn set_memory(&self, domain: &Domain, kib: u64, scope: SizeScope) -> Result<()> {
        self.record(
            SimOp::SetMemory,
            Call::SetMemory {
                domain: domain.clone(),
                kib,
                scope,
            },
        )?;
        self.with_domain(domain, |sim| {
            match scope {
                SizeScope::Maximum => sim.max_memory_kib = kib,
                SizeScope::Current if kib > sim.max_memory_kib => {
                    return Err(ShiftError::backend(format!(
                        "invalid argument: cannot set memory higher than max memory ({} > {})",
                        kib, sim.max_memory_kib
                    )));
                }
                SizeScope::Current => sim.memory_kib = kib,
            }
            Ok(())
        })
    }

    async fn set_vcpus(&self, domain: &Domain, count: u32, scope: SizeScope) -> Result<()> {
        self.record(
            SimOp::SetVcpus,
            Call::SetVcpus {
                domain: domain.clone(),
                count,
                scope,
            },
        )?;
        self.with_domain(domain, |sim| {
            match scope {
                SizeScope::Maximum => sim.max_vcpus = count,
                SizeScope::Current if count > sim.max_vcpus => {
                    return Err(ShiftError::backend(format!(
                        "invalid argument: requested vcpus is greater than max allowable vcpus ({} > {})",
                        count, sim.max_vcpus
                    )));
                }
                SizeScope::Current => sim.vcpus = count,
            }
            Ok(())
        })
    }

    async fn set_memory_stats_period(&self, domain: &Domain, seconds: u32) -> Result<()> {
        self.with_domain(domain, |sim| {
            sim.stats_period = seconds;
            Ok(())
        })
    }

    async fn create(&self, domain: &Domain) -> Result<()> {
        self.record(SimOp::Create, Call::Create(domain.clone()))?;
        let probes = self.options.probes_until_reachable;
        self.with_domain(domain, |sim| {
            if sim.state == DomainState::Running {
                return Err(ShiftError::backend("Requested operation is not valid: domain is already running"));
            }
            sim.state = DomainState::Running;
            sim.balloon_kib = sim.memory_kib;
            sim.probes_left = probes;
            Ok(())
        })
    }

    async fn destroy(&self, domain: &Domain) -> Result<()> {
        self.record(SimOp::Destroy, Call::Destroy(domain.clone()))?;
        self.with_domain(domain, |sim| {
            sim.state = DomainState::ShutOff;
            Ok(())
        })
    }

    async fn shutdown(&self, domain: &Domain) -> Result<()> {
        self.record(SimOp::Shutdown, Call::Shutdown(domain.clone()))?;
        self.with_domain(domain, |sim| {
            sim.state = DomainState::Other("in shutdown".to_string());
            Ok(())
        })?;

        let state = self.state.clone();
        let key = (domain.host.clone(), domain.name.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(sim) = state.lock().unwrap().domains.get_mut(&key) {
                sim.state = DomainState::ShutOff;
            }
        });
        Ok(())
    }

    async fn guest_reachable(&self, domain: &Domain) -> Result<bool> {
        self.with_domain(domain, |sim| {
            if sim.state != DomainState::Running {
                return Ok(false);
            }
            if sim.probes_left > 0 {
                sim.probes_left -= 1;
                return Ok(false);
            }
            Ok(true)
        })
    }

    async fn connect(&self, host: &str, _driver: &str, _transport: &str) -> Result<Connection> {
        self.record(SimOp::Connect, Call::Connect(host.to_string()))?;
        if self.state.lock().unwrap().unreachable_hosts.contains(host) {
            return Err(ShiftError::backend(format!(
                "Cannot establish connection to {}",
                host
            )));
        }
        Ok(Connection {
            host: host.to_string(),
            uri: self.uri_for(host),
        })
    }

    async fn remote_domain_state(
        &self,
        connection: &Connection,
        name: &str,
    ) -> Result<Option<DomainState>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .domains
            .get(&(connection.host.clone(), name.to_string()))
            .map(|sim| sim.state.clone()))
    }

    async fn migrate(
        &self,
        domain: &Domain,
        destination: &Connection,
        flags: MigrationFlags,
        migrate_uri: Option<&str>,
    ) -> Result<Domain> {
        self.record(
            SimOp::Migrate,
            Call::Migrate {
                domain: domain.clone(),
                destination: destination.host.clone(),
                flags,
                migrate_uri: migrate_uri.map(str::to_string),
            },
        )
        .and_then(|()| self.move_domain(domain, destination))
        .map_err(|e| match e {
            ShiftError::Backend(msg) => ShiftError::MigrationFailed(msg),
            other => other,
        })
    }

    async fn balloon_stats(&self, domain: &Domain) -> Result<MemoryStats> {
        Self::check_failure(&self.state.lock().unwrap(), SimOp::BalloonStats)?;
        self.with_domain(domain, |sim| {
            Ok(MemoryStats {
                unused: sim.balloon_kib.saturating_sub(sim.used_kib),
                available: sim.balloon_kib,
                actual: sim.balloon_kib,
            })
        })
    }

    async fn set_balloon(&self, domain: &Domain, kib: u64) -> Result<()> {
        self.record(
            SimOp::SetBalloon,
            Call::SetBalloon {
                domain: domain.clone(),
                kib,
            },
        )?;
        let from = self.with_domain(domain, |sim| {
            if kib > sim.max_memory_kib {
                return Err(ShiftError::backend(format!(
                    "invalid argument: cannot set memory higher than max memory ({} > {})",
                    kib, sim.max_memory_kib
                )));
            }
            Ok(sim.balloon_kib)
        })?;
        self.spawn_balloon(domain.clone(), from, kib);
        Ok(())
    }

    async fn subscribe_balloon_change(
        &self,
        domain: &Domain,
        callback: BalloonCallback,
    ) -> Result<SubscriptionHandle> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Subscribe(domain.clone()));
        state.next_handle += 1;
        let handle = state.next_handle;
        state.subscriptions.insert(handle, (domain.clone(), callback));
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Unsubscribe(handle));
        state.subscriptions.remove(&handle.0);
        Ok(())
    }
}

#[async_trait]
impl DeviceBackend for SimulatedCluster {
    async fn attach(&self, domain: &Domain, device: &PciId) -> Result<()> {
        self.record(
            SimOp::Attach,
            Call::Attach {
                domain: domain.clone(),
                device: *device,
            },
        )?;
        self.with_domain(domain, |sim| {
            if sim.devices.contains(device) {
                return Err(ShiftError::backend(format!(
                    "Requested operation is not valid: PCI device {} is in use by domain {}",
                    device, domain.name
                )));
            }
            sim.devices.push(*device);
            Ok(())
        })
    }

    async fn detach(&self, domain: &Domain) -> Result<Vec<PciId>> {
        self.record(SimOp::Detach, Call::Detach(domain.clone()))?;
        self.with_domain(domain, |sim| Ok(std::mem::take(&mut sim.devices)))
    }
}
