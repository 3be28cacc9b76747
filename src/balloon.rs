//! Memory balloon control around a migration.
//!
//! Resizing is driven by balloon-change notifications, with a slow stats
//! poll alongside for notifications that never arrive. Each notification updates a small adaptation state (last value,
//! last step, time of the step). Once the remaining distance is below one
//! observed step, the remaining time is estimated from the step rate, the
//! waiter sleeps that long, and a short active confirmation follows.

use crate::{
    Result, ShiftError,
    config::BalloonConfig,
    guard::{ScopedResource, spawn_fallback},
    hypervisor::{Domain, HypervisorBackend, MemoryStats},
    log_debug, log_info, log_warn,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// In-flight balloon size for a migration: what the guest uses plus a share
/// of its unused memory, aligned down to the page size.
pub fn migration_target(stats: &MemoryStats, headroom_percent: u64, page_size_kib: u64) -> u64 {
    let used = stats.actual.saturating_sub(stats.unused);
    let target = used + stats.unused * headroom_percent / 100;
    let page = page_size_kib.max(1);
    target - target % page
}

struct Adaptation {
    target: u64,
    last_value: u64,
    last_rate: u64,
    last_event: Instant,
    signal: Option<oneshot::Sender<Duration>>,
}

impl Adaptation {
    fn new(target: u64, initial: u64, signal: oneshot::Sender<Duration>) -> Self {
        Self {
            target,
            last_value: initial,
            last_rate: 0,
            last_event: Instant::now(),
            signal: Some(signal),
        }
    }

    /// Feed one observed balloon value, firing the signal with the estimated
    /// time left once the target is within one step.
    fn observe(&mut self, value: u64) {
        let now = Instant::now();
        let step_time = now.duration_since(self.last_event);
        let rate = self.last_value.abs_diff(value);
        let remaining = self.target.abs_diff(value);
        self.last_value = value;
        self.last_event = now;
        if rate > 0 {
            self.last_rate = rate;
        }

        if remaining != 0 && remaining >= self.last_rate {
            return;
        }
        let eta = if remaining == 0 || self.last_rate == 0 {
            Duration::ZERO
        } else {
            step_time.mul_f64(remaining as f64 / self.last_rate as f64)
        };
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(eta);
        }
    }
}

#[derive(Clone)]
pub struct BalloonController {
    hypervisor: Arc<dyn HypervisorBackend>,
    config: BalloonConfig,
}

impl BalloonController {
    pub fn new(hypervisor: Arc<dyn HypervisorBackend>, config: BalloonConfig) -> Self {
        Self { hypervisor, config }
    }

    pub fn config(&self) -> &BalloonConfig {
        &self.config
    }

    /// Drive the balloon of `domain` to `target_kib` and wait for it to get there.
    pub async fn resize(&self, domain: &Domain, target_kib: u64) -> Result<()> {
        let stats = self.hypervisor.balloon_stats(domain).await?;
        if stats.actual == target_kib {
            log_debug!("Balloon of {} already at {} KiB", domain, target_kib);
            return Ok(());
        }
        log_info!(
            "Resizing balloon of {} from {} KiB to {} KiB",
            domain,
            stats.actual,
            target_kib
        );

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(Adaptation::new(target_kib, stats.actual, tx)));
        let callback_state = state.clone();
        let handle = self
            .hypervisor
            .subscribe_balloon_change(
                domain,
                Arc::new(move |value: u64| callback_state.lock().unwrap().observe(value)),
            )
            .await?;

        let waited = self.request_and_wait(domain, target_kib, rx).await;
        let unsubscribed = self.hypervisor.unsubscribe(handle).await;
        let signalled = waited?;
        unsubscribed?;

        let tolerance = self.config.page_size_kib.max(state.lock().unwrap().last_rate);
        let confirmed = self.confirm(domain, target_kib, tolerance).await?;
        match (signalled, confirmed) {
            (_, true) => Ok(()),
            (true, false) => {
                log_warn!(
                    "Balloon of {} signalled convergence but stats still differ from {} KiB",
                    domain,
                    target_kib
                );
                Ok(())
            }
            (false, false) => Err(ShiftError::timeout(format!(
                "balloon of {} did not reach {} KiB within {:?}",
                domain.name,
                target_kib,
                self.config.resize_timeout()
            ))),
        }
    }

    /// Request the new size and wait for the convergence signal, polling the
    /// stats alongside in case notifications are late or missing. Returns
    /// whether convergence was seen before the resize timeout.
    async fn request_and_wait(
        &self,
        domain: &Domain,
        target_kib: u64,
        mut rx: oneshot::Receiver<Duration>,
    ) -> Result<bool> {
        self.hypervisor.set_balloon(domain, target_kib).await?;

        let deadline = tokio::time::Instant::now() + self.config.resize_timeout();
        let mut poll = tokio::time::interval(self.config.confirm_poll());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signal_open = true;
        loop {
            tokio::select! {
                signal = &mut rx, if signal_open => match signal {
                    Ok(eta) => {
                        log_debug!("Balloon of {} converging, {:?} left", domain, eta);
                        tokio::time::sleep(eta).await;
                        return Ok(true);
                    }
                    Err(_) => signal_open = false,
                },
                _ = poll.tick() => {
                    let stats = self.hypervisor.balloon_stats(domain).await?;
                    if stats.actual.abs_diff(target_kib) <= self.config.page_size_kib {
                        log_debug!("Balloon of {} reached {} KiB by polling", domain, stats.actual);
                        return Ok(true);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
            }
        }
    }

    /// Poll balloon stats for a bounded window until the value is within `tolerance`.
    async fn confirm(&self, domain: &Domain, target_kib: u64, tolerance: u64) -> Result<bool> {
        let deadline = Instant::now() + self.config.confirm_window();
        loop {
            let stats = self.hypervisor.balloon_stats(domain).await?;
            if stats.actual.abs_diff(target_kib) <= tolerance {
                log_debug!("Balloon of {} confirmed at {} KiB", domain, stats.actual);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.confirm_poll()).await;
        }
    }
}

/// Holds a domain's balloon at its in-flight size until released.
pub struct BalloonGuard {
    controller: BalloonController,
    domain: Domain,
    initial_kib: Option<u64>,
    released: bool,
}

impl BalloonGuard {
    /// Shrink the balloon of `domain` to its migration size. A disabled guard
    /// does nothing on acquire or release.
    pub async fn acquire(controller: BalloonController, domain: Domain, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self {
                controller,
                domain,
                initial_kib: None,
                released: true,
            });
        }

        let hypervisor = controller.hypervisor.clone();
        let initial = hypervisor.domain_info(&domain).await?.max_memory_kib;
        let stats = hypervisor.balloon_stats(&domain).await?;
        let target = migration_target(
            &stats,
            controller.config.headroom_percent,
            controller.config.page_size_kib,
        );
        log_info!("Balloon of {}: {}", domain, stats);

        let mut guard = Self {
            controller,
            domain,
            initial_kib: Some(initial),
            released: false,
        };
        if target >= stats.actual {
            log_info!(
                "Balloon of {} not shrunk, in-flight size {} KiB is not below {} KiB",
                guard.domain,
                target,
                stats.actual
            );
            return Ok(guard);
        }

        log_info!("Memory during migration of {}: {} KiB", guard.domain, target);
        if let Err(e) = guard.controller.resize(&guard.domain, target).await {
            guard.release_quietly().await;
            return Err(e);
        }
        Ok(guard)
    }

    /// Value the balloon is restored to, captured before shrinking.
    pub fn initial_kib(&self) -> Option<u64> {
        self.initial_kib
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn retarget(&mut self, domain: Domain) {
        self.domain = domain;
    }
}

#[async_trait]
impl ScopedResource for BalloonGuard {
    fn label(&self) -> &'static str {
        "balloon guard"
    }

    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match self.initial_kib {
            Some(initial) => self.controller.resize(&self.domain, initial).await,
            None => Ok(()),
        }
    }
}

impl Drop for BalloonGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(initial) = self.initial_kib {
            let controller = self.controller.clone();
            let domain = self.domain.clone();
            spawn_fallback("balloon guard", async move {
                controller.resize(&domain, initial).await
            });
        }
    }
}
