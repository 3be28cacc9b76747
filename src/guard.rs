//! Scoped resources released on every exit path of a guarded region.
//!
//! Async cleanup cannot run inside `Drop`, so a guarded region releases its
//! resources explicitly, on success and on error alike. `release` is
//! idempotent. A guard that is dropped without being released (a panic
//! or a cancelled future) hands its cleanup to the runtime as a last resort.

use crate::{
    Result,
    hypervisor::{DeviceBackend, Domain},
    log_error, log_info, log_warn,
    pci::PciId,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait ScopedResource: Send {
    fn label(&self) -> &'static str;

    /// Undo the acquisition. Calls after the first are no-ops.
    async fn release(&mut self) -> Result<()>;

    /// Release during unwinding: errors are logged, never returned.
    async fn release_quietly(&mut self) {
        if let Err(e) = self.release().await {
            log_error!("Error in {} cleanup: {}", self.label(), e);
        }
    }
}

/// Run `cleanup` on the current runtime for a guard dropped while still held.
pub(crate) fn spawn_fallback<F>(label: &'static str, cleanup: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    log_warn!("{} dropped without release, restoring in background", label);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = cleanup.await {
                    log_error!("Error in {} background cleanup: {}", label, e);
                }
            });
        }
        Err(_) => log_error!("No runtime available to release {}", label),
    }
}

/// Keeps passthrough devices off a domain for the duration of a migration.
pub struct DeviceGuard {
    backend: Arc<dyn DeviceBackend>,
    domain: Domain,
    devices: Vec<PciId>,
    released: bool,
}

impl DeviceGuard {
    /// Detach every passthrough device from `domain`, remembering them in order.
    pub async fn acquire(backend: Arc<dyn DeviceBackend>, domain: Domain) -> Result<Self> {
        let devices = backend.detach(&domain).await?;
        if !devices.is_empty() {
            log_info!(
                "Detached {} device(s) from {}: {}",
                devices.len(),
                domain,
                join_ids(&devices)
            );
        }
        Ok(Self {
            backend,
            domain,
            devices,
            released: false,
        })
    }

    pub fn devices(&self) -> &[PciId] {
        &self.devices
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Reattach to `domain` instead, e.g. the destination after a successful migration.
    pub fn retarget(&mut self, domain: Domain) {
        self.domain = domain;
    }
}

async fn reattach(backend: &dyn DeviceBackend, domain: &Domain, devices: &[PciId]) -> Result<()> {
    let mut first_error = None;
    for device in devices {
        if let Err(e) = backend.attach(domain, device).await {
            log_error!("Failed to reattach {} to {}: {}", device, domain, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn join_ids(devices: &[PciId]) -> String {
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl ScopedResource for DeviceGuard {
    fn label(&self) -> &'static str {
        "device guard"
    }

    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.devices.is_empty() {
            return Ok(());
        }
        log_info!(
            "Reattaching {} device(s) to {}",
            self.devices.len(),
            self.domain
        );
        reattach(self.backend.as_ref(), &self.domain, &self.devices).await
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if self.released || self.devices.is_empty() {
            return;
        }
        self.released = true;
        let backend = self.backend.clone();
        let domain = self.domain.clone();
        let devices = std::mem::take(&mut self.devices);
        spawn_fallback("device guard", async move {
            reattach(backend.as_ref(), &domain, &devices).await
        });
    }
}
