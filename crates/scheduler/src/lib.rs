//! The tick loop. A fixed-cadence trigger runs promotion per delivery
//! config, then fans resource checks out up to a parallelism bound. A
//! timeout wraps each whole check; a hung check becomes a reported
//! timed-out outcome, never a stalled tick.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info};

use rudder_actuator::ResourceActuator;
use rudder_core::DeliveryConfig;
use rudder_promotion::EnvironmentPromotionChecker;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(60),
            parallelism: 16,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let interval: u64 = std::env::var("RUDDER_CHECK_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.check_interval.as_secs());
        let timeout: u64 = std::env::var("RUDDER_CHECK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.check_timeout.as_secs());
        let parallelism: usize = std::env::var("RUDDER_CHECK_PARALLELISM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.parallelism);
        Self {
            check_interval: Duration::from_secs(interval),
            check_timeout: Duration::from_secs(timeout),
            parallelism: parallelism.max(1),
        }
    }
}

/// Shared snapshot of the delivery configs under management. The loop
/// reads a consistent snapshot each tick; writers swap in a whole new set.
#[derive(Default)]
pub struct ConfigCache {
    configs: ArcSwap<Vec<Arc<DeliveryConfig>>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<DeliveryConfig>>> {
        self.configs.load_full()
    }

    pub fn replace(&self, configs: Vec<DeliveryConfig>) {
        self.configs.store(Arc::new(configs.into_iter().map(Arc::new).collect()));
    }
}

pub struct CheckScheduler {
    actuator: Arc<ResourceActuator>,
    promotion: Arc<EnvironmentPromotionChecker>,
    configs: Arc<ConfigCache>,
    config: SchedulerConfig,
}

impl CheckScheduler {
    pub fn new(
        actuator: Arc<ResourceActuator>,
        promotion: Arc<EnvironmentPromotionChecker>,
        configs: Arc<ConfigCache>,
        config: SchedulerConfig,
    ) -> Self {
        Self { actuator, promotion, configs, config }
    }

    /// Ticks until the lifecycle handle flips to shutdown. The handle is
    /// also consulted at the top of each tick so a stop request between
    /// interval fires does not start another round.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            parallelism = self.config.parallelism,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// One full round: promotion first, then every resource of every
    /// delivery config, concurrently up to the parallelism bound.
    pub async fn tick(&self) {
        let started = std::time::Instant::now();
        counter!("scheduler_ticks_total", 1u64);
        let configs = self.configs.snapshot();
        for config in configs.iter() {
            self.promotion.check_environments(config).await;
            futures::stream::iter(config.resources())
                .for_each_concurrent(self.config.parallelism, |resource| {
                    let config = Arc::clone(config);
                    async move {
                        let check = self.actuator.check_resource(&config, resource);
                        if tokio::time::timeout(self.config.check_timeout, check).await.is_err() {
                            debug!(resource = %resource.id(), "check timed out");
                            self.actuator.record_timeout(resource).await;
                        }
                    }
                })
                .await;
        }
        histogram!("scheduler_tick_ms", started.elapsed().as_secs_f64() * 1000.0);
    }
}
