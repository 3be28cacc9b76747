// Integration tests for the guarded migration path
use std::sync::Arc;
use std::time::Duration;
use vmshift::{
    MigrationProtocol, Task, TaskExecutor, WorkCounter,
    config::ShiftConfig,
    hypervisor::DomainState,
    pci::PciId,
    sim::{Call, SimDomainSpec, SimOp, SimulatedCluster},
    task::{MigrateParams, Status},
    transport::{Communicator, InMemoryBroker, QoS},
};

const MAX_KIB: u64 = 4_194_304;
const USED_KIB: u64 = 1_048_576;

fn test_config() -> ShiftConfig {
    let mut config = ShiftConfig::default();
    config.host.name = "node01".to_string();
    config.balloon.resize_timeout_ms = 2_000;
    config.balloon.confirm_window_ms = 100;
    config.balloon.confirm_poll_ms = 5;
    config.barrier.ack_timeout_ms = 1_000;
    config
}

fn devices() -> Vec<PciId> {
    vec![
        "0000:82:00.0".parse().unwrap(),
        "0000:82:00.1".parse().unwrap(),
    ]
}

struct Harness {
    cluster: SimulatedCluster,
    broker: Arc<InMemoryBroker>,
    protocol: MigrationProtocol,
}

fn harness() -> Harness {
    let cluster = SimulatedCluster::new("node01");
    cluster.add_domain(
        "node01",
        "vm1",
        SimDomainSpec::running(MAX_KIB, USED_KIB).with_devices(devices()),
    );
    let broker = Arc::new(InMemoryBroker::new("vmshift/results"));
    let protocol = MigrationProtocol::new(
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        broker.clone(),
        Arc::new(test_config()),
    );
    Harness {
        cluster,
        broker,
        protocol,
    }
}

/// Acknowledge every suspend request for `vm` from `peers` distinct processes.
async fn spawn_fabric(broker: Arc<InMemoryBroker>, vm: &str, peers: usize) {
    let mut requests = broker
        .subscribe(&format!("{}/suspend/request", vm), QoS::ExactlyOnce)
        .await
        .unwrap();
    let response_topic = format!("{}/suspend/response", vm);
    tokio::spawn(async move {
        while let Ok(payload) = requests.recv().await {
            if !payload.contains("suspend") {
                continue;
            }
            for rank in 0..peers {
                let ack = format!(r#"{{"peer":"rank{}"}}"#, rank);
                broker
                    .publish(&response_topic, &ack, QoS::ExactlyOnce)
                    .await
                    .unwrap();
            }
        }
    });
}

fn migrate_params() -> MigrateParams {
    MigrateParams {
        vm_name: "vm1".to_string(),
        destination: "node02".to_string(),
        live: true,
        rdma: false,
        driver: None,
        transport: None,
        pscom_hook_procs: 2,
        memory_ballooning: true,
        concurrent: true,
    }
}

fn set_balloon_calls(calls: &[Call]) -> Vec<(String, u64)> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::SetBalloon { domain, kib } => Some((domain.host.clone(), *kib)),
            _ => None,
        })
        .collect()
}

fn attach_calls(calls: &[Call]) -> Vec<(String, PciId)> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::Attach { domain, device } => Some((domain.host.clone(), *device)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_migration_restores_resources_on_destination() {
    let h = harness();
    spawn_fabric(h.broker.clone(), "vm1", 2).await;

    let (dest, timings) = h.protocol.migrate(&migrate_params()).await.unwrap();
    assert_eq!(dest.host, "node02");

    assert!(h.cluster.domain("node01", "vm1").is_none());
    let vm = h.cluster.domain("node02", "vm1").unwrap();
    assert_eq!(vm.state, DomainState::Running);
    assert_eq!(vm.balloon_kib, MAX_KIB);
    assert_eq!(vm.devices, devices());

    let calls = h.cluster.calls();
    // Shrunk on the source, restored once on the destination.
    let balloon = set_balloon_calls(&calls);
    assert_eq!(balloon.len(), 2);
    assert_eq!(balloon[0].0, "node01");
    assert!(balloon[0].1 < MAX_KIB);
    assert_eq!(balloon[1], ("node02".to_string(), MAX_KIB));

    let attached = attach_calls(&calls);
    assert_eq!(
        attached,
        devices()
            .into_iter()
            .map(|d| ("node02".to_string(), d))
            .collect::<Vec<_>>()
    );

    // Detach, then shrink, then migrate.
    let detach = calls.iter().position(|c| matches!(c, Call::Detach(_))).unwrap();
    let shrink = calls
        .iter()
        .position(|c| matches!(c, Call::SetBalloon { .. }))
        .unwrap();
    let migrate = calls
        .iter()
        .position(|c| matches!(c, Call::Migrate { .. }))
        .unwrap();
    assert!(detach < shrink && shrink < migrate);

    let requests = h.broker.published_on("vm1/suspend/request");
    assert_eq!(requests.len(), 2);
    assert!(requests[1].contains("resume"));
    assert_eq!(timings.phases().len(), 7);
    assert_eq!(h.cluster.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_failed_migration_restores_on_source() {
    let h = harness();
    spawn_fabric(h.broker.clone(), "vm1", 2).await;
    h.cluster
        .fail(SimOp::Migrate, "operation failed: migration out job: unexpectedly failed");

    let executor = TaskExecutor::new(h.protocol.clone(), WorkCounter::new());
    let task = Task::from_yaml(
        "operation: migrate\n\
         concurrent: false\n\
         items:\n\
         \x20 - vm_name: vm1\n\
         \x20   destination: node02\n\
         \x20   live: true\n\
         \x20   pscom_hook_procs: 2\n\
         \x20   memory_ballooning: true\n",
    )
    .unwrap();
    let reply = executor.run(task).await.unwrap();

    assert_eq!(reply.title, "vm migrated");
    assert_eq!(reply.results.len(), 1);
    assert_eq!(reply.results[0].status, Status::Error);
    assert_eq!(
        reply.results[0].details.as_deref(),
        Some("Migration failed: operation failed: migration out job: unexpectedly failed")
    );

    let vm = h.cluster.domain("node01", "vm1").unwrap();
    assert_eq!(vm.state, DomainState::Running);
    assert_eq!(vm.balloon_kib, MAX_KIB);
    assert_eq!(vm.devices, devices());
    assert!(h.cluster.domain("node02", "vm1").is_none());

    let calls = h.cluster.calls();
    let balloon = set_balloon_calls(&calls);
    assert_eq!(balloon.len(), 2);
    assert!(balloon.iter().all(|(host, _)| host == "node01"));
    assert_eq!(balloon[1].1, MAX_KIB);
    assert!(attach_calls(&calls).iter().all(|(host, _)| host == "node01"));
    assert_eq!(attach_calls(&calls).len(), 2);

    // The fabric is resumed even though the migration failed.
    let requests = h.broker.published_on("vm1/suspend/request");
    assert!(requests.last().unwrap().contains("resume"));
}

#[tokio::test]
async fn test_unreachable_destination_restores_on_source() {
    let h = harness();
    h.cluster.set_host_reachable("node02", false);
    let params = MigrateParams {
        pscom_hook_procs: 0,
        ..migrate_params()
    };

    let err = h.protocol.migrate(&params).await.err().unwrap();
    assert_eq!(err.to_string(), "Cannot establish connection to node02");

    let vm = h.cluster.domain("node01", "vm1").unwrap();
    assert_eq!(vm.devices, devices());
    assert_eq!(vm.balloon_kib, MAX_KIB);
}

#[tokio::test]
async fn test_missing_suspend_quorum_aborts_before_touching_domain() {
    let h = harness();
    spawn_fabric(h.broker.clone(), "vm1", 1).await;
    let protocol = MigrationProtocol::new(
        Arc::new(h.cluster.clone()),
        Arc::new(h.cluster.clone()),
        h.broker.clone(),
        Arc::new({
            let mut config = test_config();
            config.barrier.ack_timeout_ms = 50;
            config
        }),
    );

    let err = protocol.migrate(&migrate_params()).await.err().unwrap();
    assert!(err.to_string().starts_with("Timeout"));
    assert!(!h.cluster.calls().iter().any(|c| matches!(c, Call::Detach(_))));
    assert!(
        h.broker
            .published_on("vm1/suspend/request")
            .last()
            .unwrap()
            .contains("resume")
    );
}

#[tokio::test]
async fn test_concurrent_migrations_of_different_domains() {
    let h = harness();
    h.cluster
        .add_domain("node01", "vm2", SimDomainSpec::running(MAX_KIB, USED_KIB));
    let executor = TaskExecutor::new(h.protocol.clone(), WorkCounter::new());
    let task = Task::from_yaml(
        "operation: migrate\n\
         items:\n\
         \x20 - {vm_name: vm1, destination: node02, memory_ballooning: true}\n\
         \x20 - {vm_name: vm2, destination: node03, memory_ballooning: true}\n",
    )
    .unwrap();

    executor.execute(task).await.unwrap();
    assert!(
        executor
            .work()
            .wait_idle_timeout(Duration::from_secs(5))
            .await
    );

    assert_eq!(h.cluster.domain("node02", "vm1").unwrap().balloon_kib, MAX_KIB);
    assert_eq!(h.cluster.domain("node03", "vm2").unwrap().balloon_kib, MAX_KIB);
    assert_eq!(h.broker.published_on("vmshift/results").len(), 1);
}
