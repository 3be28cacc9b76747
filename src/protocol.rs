//! Start, stop and migrate for a single domain.
//!
//! Migration runs inside a guarded region: devices are detached first, then
//! the balloon is shrunk, then the hypervisor migrates. Whatever happens, the
//! guards are released in reverse order before control returns, against the
//! destination on success and against the source otherwise.

use crate::{
    Result, ShiftError,
    balloon::{BalloonController, BalloonGuard},
    barrier::SuspendBarrier,
    config::ShiftConfig,
    guard::{DeviceGuard, ScopedResource},
    hypervisor::{DeviceBackend, Domain, DomainState, HypervisorBackend, MigrationFlags, SizeScope},
    log_debug, log_info, log_warn,
    task::{MigrateParams, StartParams, StopParams},
    transport::Communicator,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Suspend,
    DetachDevices,
    ShrinkBalloon,
    Migrate,
    RestoreBalloon,
    ReattachDevices,
    Resume,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Suspend => "suspend",
            MigrationPhase::DetachDevices => "detach devices",
            MigrationPhase::ShrinkBalloon => "shrink balloon",
            MigrationPhase::Migrate => "migrate",
            MigrationPhase::RestoreBalloon => "restore balloon",
            MigrationPhase::ReattachDevices => "reattach devices",
            MigrationPhase::Resume => "resume",
        };
        f.write_str(name)
    }
}

/// Wall-clock time spent in each phase of one migration.
#[derive(Debug, Default, Clone)]
pub struct PhaseTimings {
    phases: Vec<(MigrationPhase, Duration)>,
}

impl PhaseTimings {
    fn begin(&self, vm_name: &str, phase: MigrationPhase) -> Instant {
        log_debug!("{}: {}", vm_name, phase);
        Instant::now()
    }

    fn end(&mut self, phase: MigrationPhase, started: Instant) {
        self.phases.push((phase, started.elapsed()));
    }

    pub fn get(&self, phase: MigrationPhase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
    }

    pub fn phases(&self) -> &[(MigrationPhase, Duration)] {
        &self.phases
    }

    pub fn total(&self) -> Duration {
        self.phases.iter().map(|(_, d)| *d).sum()
    }
}

impl fmt::Display for PhaseTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (phase, duration)) in self.phases.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {} ms", phase, duration.as_millis())?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MigrationProtocol {
    hypervisor: Arc<dyn HypervisorBackend>,
    devices: Arc<dyn DeviceBackend>,
    comm: Arc<dyn Communicator>,
    balloon: BalloonController,
    config: Arc<ShiftConfig>,
}

impl MigrationProtocol {
    pub fn new(
        hypervisor: Arc<dyn HypervisorBackend>,
        devices: Arc<dyn DeviceBackend>,
        comm: Arc<dyn Communicator>,
        config: Arc<ShiftConfig>,
    ) -> Self {
        let balloon = BalloonController::new(hypervisor.clone(), config.balloon.clone());
        Self {
            hypervisor,
            devices,
            comm,
            balloon,
            config,
        }
    }

    pub fn communicator(&self) -> Arc<dyn Communicator> {
        self.comm.clone()
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.config
    }

    async fn resolve_for_start(&self, params: &StartParams) -> Result<Domain> {
        if let Some(name) = &params.vm_name {
            match self.hypervisor.find_domain(name).await {
                Ok(domain) => return Ok(domain),
                Err(ShiftError::DomainNotFound(_)) if params.xml.is_some() => {}
                Err(e) => return Err(e),
            }
        }
        match &params.xml {
            Some(xml) => self.hypervisor.define_domain(xml).await,
            None => Err(ShiftError::DomainNotFound(params.display_name())),
        }
    }

    /// Fail when another cluster node already runs a domain of this name.
    /// Nodes that cannot be probed are skipped.
    async fn check_remote(&self, vm_name: &str) -> Result<()> {
        let cluster = &self.config.cluster;
        if !cluster.check_remote {
            return Ok(());
        }
        let local = self.hypervisor.host_name();
        for node in cluster.nodes.iter().filter(|n| n.as_str() != local) {
            let connection = match self
                .hypervisor
                .connect(
                    node,
                    &self.config.migration.default_driver,
                    &self.config.migration.default_transport,
                )
                .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    log_warn!("Skipping remote check on {}: {}", node, e);
                    continue;
                }
            };
            match self.hypervisor.remote_domain_state(&connection, vm_name).await {
                Ok(None) | Ok(Some(DomainState::ShutOff)) => {}
                Ok(Some(state)) => {
                    return Err(ShiftError::RemoteConflict {
                        vm: vm_name.to_string(),
                        node: node.clone(),
                        state: state.to_string(),
                    });
                }
                Err(e) => log_warn!("Skipping remote check on {}: {}", node, e),
            }
        }
        Ok(())
    }

    pub async fn start(&self, params: &StartParams) -> Result<Domain> {
        let domain = self.resolve_for_start(params).await?;
        log_info!("Starting {}", domain);

        let state = self.hypervisor.domain_state(&domain).await?;
        if state != DomainState::ShutOff {
            return Err(ShiftError::WrongDomainState {
                expected: DomainState::ShutOff.to_string(),
                actual: state.to_string(),
            });
        }
        self.check_remote(&domain.name).await?;

        if let Some(memory) = params.memory {
            self.hypervisor
                .set_memory(&domain, memory, SizeScope::Maximum)
                .await?;
            self.hypervisor
                .set_memory(&domain, memory, SizeScope::Current)
                .await?;
        }
        if let Some(vcpus) = params.vcpus {
            self.hypervisor
                .set_vcpus(&domain, vcpus, SizeScope::Maximum)
                .await?;
            self.hypervisor
                .set_vcpus(&domain, vcpus, SizeScope::Current)
                .await?;
        }
        self.hypervisor
            .set_memory_stats_period(&domain, self.config.start.memory_stats_period_secs)
            .await?;

        self.hypervisor.create(&domain).await?;
        for device in &params.pci_ids {
            log_debug!("Attaching {} to {}", device, domain);
            self.devices.attach(&domain, device).await?;
        }

        self.wait_until_reachable(&domain).await?;
        log_info!("{} is up", domain);
        Ok(domain)
    }

    async fn wait_until_reachable(&self, domain: &Domain) -> Result<()> {
        let timeout = self.config.start.readiness_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.hypervisor.guest_reachable(domain).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ShiftError::timeout(format!(
                    "{} not reachable after {:?}",
                    domain.name, timeout
                )));
            }
            tokio::time::sleep(self.config.start.poll_interval()).await;
        }
    }

    pub async fn stop(&self, params: &StopParams) -> Result<()> {
        let domain = self.hypervisor.find_domain(&params.vm_name).await?;
        if self.hypervisor.domain_state(&domain).await? != DomainState::Running {
            return Err(ShiftError::NotRunning(domain.name));
        }

        let detached = self.devices.detach(&domain).await?;
        if !detached.is_empty() {
            log_info!("Detached {} device(s) from {}", detached.len(), domain);
        }

        if params.force {
            log_info!("Destroying {}", domain);
            self.hypervisor.destroy(&domain).await?;
        } else {
            log_info!("Shutting down {}", domain);
            self.hypervisor.shutdown(&domain).await?;
        }
        self.wait_until_shut_off(&domain).await
    }

    async fn wait_until_shut_off(&self, domain: &Domain) -> Result<()> {
        let timeout = self.config.stop.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.hypervisor.domain_state(domain).await? == DomainState::ShutOff {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ShiftError::timeout(format!(
                    "{} still running after {:?}",
                    domain.name, timeout
                )));
            }
            tokio::time::sleep(self.config.stop.poll_interval()).await;
        }
    }

    /// Migrate a running domain, returning its handle on the destination
    /// together with the time spent per phase.
    pub async fn migrate(&self, params: &MigrateParams) -> Result<(Domain, PhaseTimings)> {
        let domain = self.hypervisor.find_domain(&params.vm_name).await?;
        if self.hypervisor.domain_state(&domain).await? != DomainState::Running {
            return Err(ShiftError::NotRunning(domain.name));
        }
        log_info!(
            "Migrating {} to {} (live: {}, rdma: {}, ballooning: {})",
            domain,
            params.destination,
            params.live,
            params.rdma,
            params.memory_ballooning
        );

        let mut timings = PhaseTimings::default();
        let started = timings.begin(&domain.name, MigrationPhase::Suspend);
        let mut barrier = SuspendBarrier::suspend(
            self.comm.clone(),
            &domain.name,
            params.pscom_hook_procs,
            &self.config.barrier,
        )
        .await?;
        timings.end(MigrationPhase::Suspend, started);

        let result = self.guarded_transfer(domain.clone(), params, &mut timings).await;

        let started = timings.begin(&domain.name, MigrationPhase::Resume);
        barrier.release_quietly().await;
        timings.end(MigrationPhase::Resume, started);

        log_info!(
            "Migration of {} {} after {} ms ({})",
            domain.name,
            if result.is_ok() { "finished" } else { "failed" },
            timings.total().as_millis(),
            timings
        );
        result.map(|dest| (dest, timings))
    }

    async fn guarded_transfer(
        &self,
        domain: Domain,
        params: &MigrateParams,
        timings: &mut PhaseTimings,
    ) -> Result<Domain> {
        let started = timings.begin(&domain.name, MigrationPhase::DetachDevices);
        let mut devices = DeviceGuard::acquire(self.devices.clone(), domain.clone()).await?;
        timings.end(MigrationPhase::DetachDevices, started);

        let started = timings.begin(&domain.name, MigrationPhase::ShrinkBalloon);
        let mut balloon =
            match BalloonGuard::acquire(self.balloon.clone(), domain.clone(), params.memory_ballooning)
                .await
            {
                Ok(balloon) => balloon,
                Err(e) => {
                    devices.release_quietly().await;
                    return Err(e);
                }
            };
        timings.end(MigrationPhase::ShrinkBalloon, started);

        let started = timings.begin(&domain.name, MigrationPhase::Migrate);
        let outcome = self.transfer(&domain, params).await;
        timings.end(MigrationPhase::Migrate, started);

        match outcome {
            Ok(dest) => {
                balloon.retarget(dest.clone());
                devices.retarget(dest.clone());

                let started = timings.begin(&dest.name, MigrationPhase::RestoreBalloon);
                let restored = balloon.release().await;
                timings.end(MigrationPhase::RestoreBalloon, started);

                let started = timings.begin(&dest.name, MigrationPhase::ReattachDevices);
                let reattached = devices.release().await;
                timings.end(MigrationPhase::ReattachDevices, started);

                restored?;
                reattached?;
                Ok(dest)
            }
            Err(e) => {
                log_warn!("Migration of {} failed, restoring on source: {}", domain, e);
                let started = timings.begin(&domain.name, MigrationPhase::RestoreBalloon);
                balloon.release_quietly().await;
                timings.end(MigrationPhase::RestoreBalloon, started);

                let started = timings.begin(&domain.name, MigrationPhase::ReattachDevices);
                devices.release_quietly().await;
                timings.end(MigrationPhase::ReattachDevices, started);
                Err(e)
            }
        }
    }

    async fn transfer(&self, domain: &Domain, params: &MigrateParams) -> Result<Domain> {
        let migration = &self.config.migration;
        let driver = params.driver.as_deref().unwrap_or(&migration.default_driver);
        let transport = params
            .transport
            .as_deref()
            .unwrap_or(&migration.default_transport);
        let connection = self
            .hypervisor
            .connect(&params.destination, driver, transport)
            .await?;

        let flags = MigrationFlags {
            live: params.live,
            rdma: params.rdma,
        };
        let migrate_uri = params.rdma.then(|| self.config.rdma_uri(&params.destination));
        if let Some(uri) = &migrate_uri {
            log_debug!("Using migrate uri {}", uri);
        }
        self.hypervisor
            .migrate(domain, &connection, flags, migrate_uri.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalloonConfig;
    use crate::sim::{Call, SimDomainSpec, SimOp, SimulatedCluster};
    use crate::pci::PciId;
    use crate::transport::InMemoryBroker;

    fn config(nodes: &[&str]) -> Arc<ShiftConfig> {
        let mut config = ShiftConfig::default();
        config.host.name = "node01".to_string();
        config.start.poll_interval_ms = 1;
        config.stop.poll_interval_ms = 1;
        config.barrier.ack_timeout_ms = 50;
        config.balloon = BalloonConfig {
            resize_timeout_ms: 500,
            confirm_window_ms: 50,
            confirm_poll_ms: 5,
            ..BalloonConfig::default()
        };
        config.cluster.nodes = nodes.iter().map(|n| n.to_string()).collect();
        Arc::new(config)
    }

    fn protocol(cluster: &SimulatedCluster, nodes: &[&str]) -> MigrationProtocol {
        MigrationProtocol::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            Arc::new(InMemoryBroker::new("vmshift/results")),
            config(nodes),
        )
    }

    fn migrate_params(vm: &str, dest: &str) -> MigrateParams {
        MigrateParams {
            vm_name: vm.to_string(),
            destination: dest.to_string(),
            live: true,
            rdma: false,
            driver: None,
            transport: None,
            pscom_hook_procs: 0,
            memory_ballooning: false,
            concurrent: true,
        }
    }

    #[tokio::test]
    async fn test_start_applies_sizing_before_create() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        let protocol = protocol(&cluster, &[]);

        let params = StartParams {
            vcpus: Some(4),
            memory: Some(2_097_152),
            ..StartParams::named("vm1")
        };
        protocol.start(&params).await.unwrap();

        let vm = cluster.domain("node01", "vm1").unwrap();
        assert_eq!(vm.state, DomainState::Running);
        assert_eq!(vm.vcpus, 4);
        assert_eq!(vm.memory_kib, 2_097_152);
        assert_eq!(vm.stats_period, 1);

        let calls = cluster.calls();
        let create = calls.iter().position(|c| matches!(c, Call::Create(_))).unwrap();
        let last_sizing = calls
            .iter()
            .rposition(|c| matches!(c, Call::SetMemory { .. } | Call::SetVcpus { .. }))
            .unwrap();
        assert!(last_sizing < create);
    }

    #[tokio::test]
    async fn test_start_rejects_running_domain() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        let protocol = protocol(&cluster, &[]);

        let err = protocol.start(&StartParams::named("vm1")).await.unwrap_err();
        assert!(matches!(err, ShiftError::WrongDomainState { .. }));
    }

    #[tokio::test]
    async fn test_start_defines_from_xml() {
        let cluster = SimulatedCluster::new("node01");
        let protocol = protocol(&cluster, &[]);
        let params = StartParams {
            vm_name: None,
            xml: Some("<domain type='kvm'><name>vm7</name></domain>".to_string()),
            ..StartParams::named("")
        };

        let domain = protocol.start(&params).await.unwrap();
        assert_eq!(domain.name, "vm7");
        assert_eq!(
            cluster.domain("node01", "vm7").unwrap().state,
            DomainState::Running
        );
    }

    #[tokio::test]
    async fn test_start_detects_remote_conflict() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        cluster.add_domain("node02", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        let protocol = protocol(&cluster, &["node01", "node02"]);

        let err = protocol.start(&StartParams::named("vm1")).await.unwrap_err();
        assert!(matches!(err, ShiftError::RemoteConflict { ref node, .. } if node == "node02"));
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Create(_))));
    }

    #[tokio::test]
    async fn test_start_skips_unreachable_nodes() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        cluster.set_host_reachable("node03", false);
        let protocol = protocol(&cluster, &["node03"]);

        protocol.start(&StartParams::named("vm1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_requires_running_domain() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        let protocol = protocol(&cluster, &[]);

        let err = protocol
            .stop(&StopParams {
                vm_name: "vm1".to_string(),
                force: true,
                concurrent: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Domain not running.");
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_stop_waits_for_shut_off() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        let protocol = protocol(&cluster, &[]);

        protocol
            .stop(&StopParams {
                vm_name: "vm1".to_string(),
                force: false,
                concurrent: true,
            })
            .await
            .unwrap();
        assert_eq!(
            cluster.domain("node01", "vm1").unwrap().state,
            DomainState::ShutOff
        );
        assert!(cluster.calls().iter().any(|c| matches!(c, Call::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_rdma_migration_passes_uri() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        let protocol = protocol(&cluster, &[]);

        let params = MigrateParams {
            rdma: true,
            ..migrate_params("vm1", "node02")
        };
        let (dest, timings) = protocol.migrate(&params).await.unwrap();
        assert_eq!(dest.host, "node02");
        assert!(timings.get(MigrationPhase::Migrate).is_some());

        let migrate_uri = cluster.calls().into_iter().find_map(|c| match c {
            Call::Migrate { migrate_uri, flags, .. } => {
                assert!(flags.rdma && flags.live);
                migrate_uri
            }
            _ => None,
        });
        assert_eq!(migrate_uri.as_deref(), Some("rdma://node02-ib"));
    }

    #[tokio::test]
    async fn test_migration_rejected_when_not_running() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        let protocol = protocol(&cluster, &[]);

        let err = protocol
            .migrate(&migrate_params("vm1", "node02"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Domain not running.");
    }

    #[tokio::test]
    async fn test_failed_detach_leaves_nothing_to_restore() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        cluster.fail(SimOp::Detach, "internal error: device busy");
        let protocol = protocol(&cluster, &[]);

        let err = protocol
            .migrate(&migrate_params("vm1", "node02"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "internal error: device busy");
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Migrate { .. })));
    }

    fn passthrough() -> Vec<PciId> {
        vec![
            PciId::new(0, 0x82, 0, 1),
            PciId::new(0, 0x81, 0, 0),
            PciId::new(0, 0x03, 0, 0),
        ]
    }

    #[tokio::test]
    async fn test_start_attaches_devices_in_order_after_create() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::shut_off(1 << 20));
        let protocol = protocol(&cluster, &[]);

        let params = StartParams {
            pci_ids: passthrough(),
            ..StartParams::named("vm1")
        };
        protocol.start(&params).await.unwrap();

        let calls = cluster.calls();
        let create = calls.iter().position(|c| matches!(c, Call::Create(_))).unwrap();
        let attached: Vec<(usize, PciId)> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::Attach { device, .. } => Some((i, *device)),
                _ => None,
            })
            .collect();
        assert!(attached.iter().all(|(i, _)| *i > create));
        assert_eq!(
            attached.into_iter().map(|(_, d)| d).collect::<Vec<_>>(),
            passthrough()
        );
        assert_eq!(cluster.domain("node01", "vm1").unwrap().devices, passthrough());
    }

    #[tokio::test]
    async fn test_stop_detaches_devices_first() {
        for force in [true, false] {
            let cluster = SimulatedCluster::new("node01");
            cluster.add_domain(
                "node01",
                "vm1",
                SimDomainSpec::running(1 << 20, 1 << 18).with_devices(passthrough()),
            );
            let protocol = protocol(&cluster, &[]);

            protocol
                .stop(&StopParams {
                    vm_name: "vm1".to_string(),
                    force,
                    concurrent: true,
                })
                .await
                .unwrap();

            let calls = cluster.calls();
            let detach = calls.iter().position(|c| matches!(c, Call::Detach(_))).unwrap();
            let halt = calls
                .iter()
                .position(|c| matches!(c, Call::Destroy(_) | Call::Shutdown(_)))
                .unwrap();
            assert!(detach < halt, "force: {}", force);
            assert!(cluster.domain("node01", "vm1").unwrap().devices.is_empty());
        }
    }

    #[tokio::test]
    async fn test_cold_migration_is_not_live() {
        let cluster = SimulatedCluster::new("node01");
        cluster.add_domain("node01", "vm1", SimDomainSpec::running(1 << 20, 1 << 18));
        let protocol = protocol(&cluster, &[]);

        let params = MigrateParams {
            live: false,
            ..migrate_params("vm1", "node02")
        };
        protocol.migrate(&params).await.unwrap();

        let flags = cluster.calls().into_iter().find_map(|c| match c {
            Call::Migrate { flags, migrate_uri, .. } => {
                assert!(migrate_uri.is_none());
                Some(flags)
            }
            _ => None,
        });
        assert_eq!(flags, Some(MigrationFlags::default()));
    }

    #[test]
    fn test_timings_display() {
        let mut timings = PhaseTimings::default();
        timings.phases.push((MigrationPhase::DetachDevices, Duration::from_millis(12)));
        timings.phases.push((MigrationPhase::Migrate, Duration::from_millis(300)));
        assert_eq!(timings.to_string(), "detach devices: 12 ms, migrate: 300 ms");
        assert_eq!(timings.total(), Duration::from_millis(312));
    }
}
