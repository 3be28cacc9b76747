//! Suspend barrier for the communication fabric running inside a guest.
//!
//! The in-guest processes are reached over pub/sub only: a suspend command
//! goes out on the VM's request topic and every process answers on the
//! response topic once it is quiesced. Resume is fire-and-forget.

use crate::{
    Result, ShiftError,
    config::BarrierConfig,
    guard::{ScopedResource, spawn_fallback},
    log_debug, log_info, log_warn,
    transport::{Communicator, QoS},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum FabricCommand {
    Suspend { vm: String },
    Resume { vm: String },
}

impl FabricCommand {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Acknowledgement sent by one in-guest process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricAck {
    pub peer: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl FabricAck {
    /// Identity of the sender. Payloads that are not a JSON ack count as their own identity.
    pub fn peer_of(payload: &str) -> String {
        match serde_json::from_str::<FabricAck>(payload) {
            Ok(ack) => ack.peer,
            Err(_) => payload.trim().to_string(),
        }
    }
}

pub struct SuspendBarrier {
    comm: Arc<dyn Communicator>,
    vm_name: String,
    request_topic: String,
    qos: QoS,
    active: bool,
}

impl SuspendBarrier {
    /// Suspend the fabric of `vm_name` and wait for `expected` distinct acknowledgements.
    ///
    /// With `expected == 0` nothing is published and the returned barrier is inert.
    /// If the quorum is not reached in time the fabric is resumed again before
    /// `ShiftError::Timeout` is returned.
    pub async fn suspend(
        comm: Arc<dyn Communicator>,
        vm_name: &str,
        expected: u32,
        config: &BarrierConfig,
    ) -> Result<Self> {
        let qos = QoS::from_level(config.qos)?;
        let mut barrier = Self {
            comm,
            vm_name: vm_name.to_string(),
            request_topic: config.request_topic_for(vm_name),
            qos,
            active: false,
        };
        if expected == 0 {
            return Ok(barrier);
        }

        let response_topic = config.response_topic_for(vm_name);
        let mut responses = barrier.comm.subscribe(&response_topic, qos).await?;
        let request = FabricCommand::Suspend {
            vm: vm_name.to_string(),
        }
        .to_json()?;
        barrier
            .comm
            .publish(&barrier.request_topic, &request, qos)
            .await?;
        barrier.active = true;
        log_info!(
            "Suspend requested for {}, waiting for {} acknowledgement(s)",
            vm_name,
            expected
        );

        let deadline = Instant::now() + config.ack_timeout();
        let mut peers = HashSet::new();
        while peers.len() < expected as usize {
            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Ok(Ok(payload)) => {
                    let peer = FabricAck::peer_of(&payload);
                    if peers.insert(peer.clone()) {
                        log_debug!("Suspend ack {}/{} from {}", peers.len(), expected, peer);
                    }
                }
                Ok(Err(e)) => {
                    barrier.release_quietly().await;
                    return Err(e);
                }
                Err(_) => {
                    log_warn!(
                        "Only {} of {} processes of {} acknowledged suspend",
                        peers.len(),
                        expected,
                        vm_name
                    );
                    barrier.release_quietly().await;
                    return Err(ShiftError::timeout(format!(
                        "suspend of {} acknowledged by {} of {} processes",
                        vm_name,
                        peers.len(),
                        expected
                    )));
                }
            }
        }
        log_info!("Communication fabric of {} suspended", vm_name);
        Ok(barrier)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn resume_payload(&self) -> Result<String> {
        FabricCommand::Resume {
            vm: self.vm_name.clone(),
        }
        .to_json()
    }
}

#[async_trait]
impl ScopedResource for SuspendBarrier {
    fn label(&self) -> &'static str {
        "suspend barrier"
    }

    async fn release(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let payload = self.resume_payload()?;
        self.comm
            .publish(&self.request_topic, &payload, self.qos)
            .await?;
        log_info!("Resume requested for {}", self.vm_name);
        Ok(())
    }
}

impl Drop for SuspendBarrier {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let comm = self.comm.clone();
        let topic = self.request_topic.clone();
        let qos = self.qos;
        let payload = self.resume_payload();
        spawn_fallback("suspend barrier", async move {
            comm.publish(&topic, &payload?, qos).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBroker;
    use std::time::Duration;

    fn config(ack_timeout_ms: u64) -> BarrierConfig {
        BarrierConfig {
            ack_timeout_ms,
            ..BarrierConfig::default()
        }
    }

    /// Answer each suspend request on `vm/suspend/request` with one ack per peer.
    async fn spawn_responder(broker: Arc<InMemoryBroker>, vm: &str, peers: Vec<&'static str>) {
        let mut requests = broker
            .subscribe(&format!("{}/suspend/request", vm), QoS::ExactlyOnce)
            .await
            .unwrap();
        let response_topic = format!("{}/suspend/response", vm);
        tokio::spawn(async move {
            while let Ok(payload) = requests.recv().await {
                let command: FabricCommand = serde_json::from_str(&payload).unwrap();
                if matches!(command, FabricCommand::Suspend { .. }) {
                    for peer in &peers {
                        let ack = format!(r#"{{"peer":"{}","status":"suspended"}}"#, peer);
                        broker
                            .publish(&response_topic, &ack, QoS::ExactlyOnce)
                            .await
                            .unwrap();
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_zero_expected_is_noop() {
        let broker = Arc::new(InMemoryBroker::new("results"));
        let mut barrier = SuspendBarrier::suspend(broker.clone(), "vm1", 0, &config(100))
            .await
            .unwrap();
        barrier.release().await.unwrap();

        assert!(!barrier.is_active());
        assert!(broker.history().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_then_resume_once() {
        let broker = Arc::new(InMemoryBroker::new("results"));
        spawn_responder(broker.clone(), "vm1", vec!["rank0", "rank1"]).await;

        let mut barrier = SuspendBarrier::suspend(broker.clone(), "vm1", 2, &config(1000))
            .await
            .unwrap();
        assert!(barrier.is_active());

        barrier.release().await.unwrap();
        barrier.release_quietly().await;
        drop(barrier);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let requests = broker.published_on("vm1/suspend/request");
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("suspend"));
        assert!(requests[1].contains("resume"));
    }

    #[tokio::test]
    async fn test_duplicate_acks_do_not_count() {
        let broker = Arc::new(InMemoryBroker::new("results"));
        spawn_responder(broker.clone(), "vm1", vec!["rank0", "rank0"]).await;

        let err = SuspendBarrier::suspend(broker.clone(), "vm1", 2, &config(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShiftError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_timeout_still_resumes() {
        let broker = Arc::new(InMemoryBroker::new("results"));

        let err = SuspendBarrier::suspend(broker.clone(), "vm1", 3, &config(30))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("0 of 3"));

        let requests = broker.published_on("vm1/suspend/request");
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("resume"));
    }

    #[test]
    fn test_plain_payload_is_its_own_peer() {
        assert_eq!(FabricAck::peer_of("proc-7\n"), "proc-7");
        assert_eq!(FabricAck::peer_of(r#"{"peer":"rank3"}"#), "rank3");
    }
}
