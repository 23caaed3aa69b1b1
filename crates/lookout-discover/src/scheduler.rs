//! Health-check and discovery scheduling.
//!
//! Two independent tokio tasks, one per cadence. Each pass runs inline in
//! its loop, so a slow pass delays the next tick instead of overlapping
//! with it. Both loops stop when the shared cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use lookout_store::Inventory;

use crate::config::DiscoverConfig;
use crate::discovery::{DiscoveryPass, DiscoverySummary};
use crate::error::Result;
use crate::prober::{ConnectionProber, HealthSummary};

/// Runs the health-check and discovery loops.
pub struct Scheduler {
    inventory: Arc<dyn Inventory>,
    prober: Arc<ConnectionProber>,
    discovery: Arc<DiscoveryPass>,
    health_every: Option<Duration>,
    discover_every: Option<Duration>,
    max_discover_duration: Option<Duration>,
}

impl Scheduler {
    pub fn new(
        config: &DiscoverConfig,
        inventory: Arc<dyn Inventory>,
        prober: Arc<ConnectionProber>,
        discovery: Arc<DiscoveryPass>,
    ) -> Self {
        Self {
            inventory,
            prober,
            discovery,
            health_every: clamp_interval(
                "check_status_interval_secs",
                config.check_status_interval_secs,
                config.max_interval_secs,
            ),
            discover_every: clamp_interval(
                "discovery_interval_secs",
                config.discovery_interval_secs,
                config.max_discovery_interval_secs,
            ),
            max_discover_duration: config.max_discover_duration(),
        }
    }

    /// Run both loops until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::new();

        match self.health_every {
            Some(period) => {
                let inventory = self.inventory.clone();
                let prober = self.prober.clone();
                let token = cancel.clone();
                handles.push(tokio::spawn(run_loop(
                    "health_check",
                    period,
                    cancel.clone(),
                    move || {
                        let inventory = inventory.clone();
                        let prober = prober.clone();
                        let token = token.clone();
                        async move {
                            if let Err(e) =
                                run_health_check_pass(inventory.as_ref(), &prober, &token).await
                            {
                                tracing::error!(error = %e, "Health check pass failed");
                            }
                        }
                    },
                )));
            }
            None => tracing::info!("Health checks disabled"),
        }

        match self.discover_every {
            Some(period) => {
                let discovery = self.discovery.clone();
                let max_duration = self.max_discover_duration;
                let token = cancel.clone();
                handles.push(tokio::spawn(run_loop(
                    "discovery",
                    period,
                    cancel.clone(),
                    move || {
                        let discovery = discovery.clone();
                        let token = token.clone();
                        async move {
                            run_discovery_pass(&discovery, max_duration, &token).await;
                        }
                    },
                )));
            }
            None => tracing::info!("Scheduled discovery disabled"),
        }

        tracing::info!(loops = handles.len(), "Scheduler started");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler loop panicked");
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

/// Apply the ceiling to a configured cadence. Zero disables the loop;
/// a zero ceiling means unbounded.
pub fn clamp_interval(name: &str, secs: u64, max_secs: u64) -> Option<Duration> {
    if secs == 0 {
        return None;
    }
    if max_secs > 0 && secs > max_secs {
        tracing::warn!(
            setting = name,
            configured = secs,
            max = max_secs,
            "Interval is larger than the maximum value, using the maximum"
        );
        return Some(Duration::from_secs(max_secs));
    }
    Some(Duration::from_secs(secs))
}

async fn run_loop<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(task = name, interval_secs = period.as_secs(), "Starting task loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let start = Instant::now();
        pass().await;
        tracing::debug!(
            task = name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Scheduled pass finished"
        );
    }

    tracing::info!(task = name, "Task loop stopped");
}

/// Probe every device in the inventory once.
pub async fn run_health_check_pass(
    inventory: &dyn Inventory,
    prober: &ConnectionProber,
    cancel: &CancellationToken,
) -> Result<HealthSummary> {
    let devices = inventory.list_devices().await?;
    Ok(prober.check_all(&devices, cancel).await)
}

/// Run one discovery pass, bounded by `max_duration` when set.
pub async fn run_discovery_pass(
    discovery: &DiscoveryPass,
    max_duration: Option<Duration>,
    cancel: &CancellationToken,
) -> DiscoverySummary {
    let pass_token = cancel.child_token();
    let deadline = max_duration.map(|limit| {
        let token = pass_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!(max_secs = limit.as_secs(), "Discovery pass hit its maximum duration");
            token.cancel();
        })
    });

    let summary = discovery.run(&pass_token).await;

    if let Some(timer) = deadline {
        timer.abort();
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use lookout_core::events::EventPayload;
    use lookout_core::{Device, ReachabilityTier};
    use lookout_store::{MemoryInventory, StaticSecretStore};
    use tokio::sync::broadcast;

    use crate::config::DiscoveryMode;
    use crate::onvif::{DeviceInformation, OnvifClient};
    use crate::prober::TierTest;

    struct AlwaysUp;

    #[async_trait]
    impl TierTest for AlwaysUp {
        fn name(&self) -> &'static str {
            "always-up"
        }

        async fn attempt(&self, _device: &Device) -> Result<()> {
            Ok(())
        }
    }

    struct Offline;

    #[async_trait]
    impl OnvifClient for Offline {
        async fn device_information(
            &self,
            _device: &Device,
            _credentials: Option<&lookout_store::Credentials>,
        ) -> Result<DeviceInformation> {
            Err(crate::error::DiscoverError::NotApplicable("offline".to_string()))
        }

        async fn system_date_and_time(&self, _device: &Device) -> Result<()> {
            Err(crate::error::DiscoverError::NotApplicable("offline".to_string()))
        }
    }

    #[test]
    fn test_clamp_interval() {
        assert_eq!(clamp_interval("x", 0, 300), None);
        assert_eq!(clamp_interval("x", 30, 300), Some(Duration::from_secs(30)));
        assert_eq!(clamp_interval("x", 900, 300), Some(Duration::from_secs(300)));
        assert_eq!(clamp_interval("x", 900, 0), Some(Duration::from_secs(900)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_tick_and_stop_on_cancel() {
        let config = DiscoverConfig {
            discovery_mode: DiscoveryMode::Netscan,
            check_status_interval_secs: 30,
            discovery_interval_secs: 60,
            ..Default::default()
        };
        let inventory = Arc::new(MemoryInventory::with_devices([Device::new(
            "lobby", "10.0.0.5", 80,
        )]));
        let (tx, mut rx) = broadcast::channel(64);

        let tiers: Vec<(Arc<dyn TierTest>, ReachabilityTier)> =
            vec![(Arc::new(AlwaysUp) as Arc<dyn TierTest>, ReachabilityTier::UpWithAuth)];
        let prober = ConnectionProber::new(tiers, inventory.clone()).with_events(tx.clone());
        let discovery = DiscoveryPass::new(
            &config,
            inventory.clone(),
            Arc::new(Offline),
            Arc::new(StaticSecretStore::default()),
        )
        .with_events(tx);

        let scheduler = Scheduler::new(&config, inventory.clone(), Arc::new(prober), Arc::new(discovery));
        let cancel = CancellationToken::new();
        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("scheduler must stop promptly")
            .unwrap();

        let (mut health, mut discovery) = (0, 0);
        while let Ok(event) = rx.try_recv() {
            match event.payload {
                EventPayload::HealthCheckCompleted { .. } => health += 1,
                EventPayload::DiscoveryCompleted { .. } => discovery += 1,
                _ => {}
            }
        }
        assert_eq!(health, 3);
        assert_eq!(discovery, 1);
        assert_eq!(
            inventory.get_device("lobby").await.unwrap().tier,
            ReachabilityTier::UpWithAuth
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_intervals_disable_loops() {
        let config = DiscoverConfig {
            check_status_interval_secs: 0,
            discovery_interval_secs: 0,
            ..Default::default()
        };
        let inventory: Arc<dyn Inventory> = Arc::new(MemoryInventory::new());
        let prober = ConnectionProber::new(Vec::new(), inventory.clone());
        let discovery = DiscoveryPass::new(
            &config,
            inventory.clone(),
            Arc::new(Offline),
            Arc::new(StaticSecretStore::default()),
        );
        let scheduler = Scheduler::new(&config, inventory, Arc::new(prober), Arc::new(discovery));

        // No loops: run returns without waiting for cancellation.
        tokio::time::timeout(Duration::from_secs(1), scheduler.run(CancellationToken::new()))
            .await
            .expect("run returns when both loops are disabled");
    }
}
