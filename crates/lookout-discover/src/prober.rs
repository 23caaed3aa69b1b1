//! Connection-tier prober.
//!
//! Stronger forms of connection are tried first: an authenticated ONVIF
//! call, then an unauthenticated one, then a bare transport check. The
//! first success decides the tier and the weaker tests are never run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::net::lookup_host;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lookout_core::events::{EventPayload, EventSource, LookoutEvent};
use lookout_core::{Device, ReachabilityStatus, ReachabilityTier};
use lookout_store::{Inventory, SecretStore};

use crate::error::{DiscoverError, Result};
use crate::netscan::{Dialer, TcpDialer};
use crate::onvif::OnvifClient;

/// One rung of the tier ladder.
#[async_trait]
pub trait TierTest: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Succeeds if the device supports this form of connection.
    async fn attempt(&self, device: &Device) -> Result<()>;
}

/// `GetDeviceInformation` with the device's stored credentials.
pub struct AuthenticatedTest {
    client: Arc<dyn OnvifClient>,
    secrets: Arc<dyn SecretStore>,
}

impl AuthenticatedTest {
    pub fn new(client: Arc<dyn OnvifClient>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { client, secrets }
    }
}

#[async_trait]
impl TierTest for AuthenticatedTest {
    fn name(&self) -> &'static str {
        "authenticated"
    }

    async fn attempt(&self, device: &Device) -> Result<()> {
        if !device.auth_mode.requires_credentials() {
            return Err(DiscoverError::NotApplicable(format!(
                "device {} is configured without authentication",
                device.name
            )));
        }
        // Single lookup: a health pass must not stall on a missing secret.
        let creds = self.secrets.get_credentials(&device.secret_ref).await?;
        self.client
            .device_information(device, Some(&creds))
            .await
            .map(|_| ())
    }
}

/// `GetSystemDateAndTime`, which devices answer without credentials.
pub struct UnauthenticatedTest {
    client: Arc<dyn OnvifClient>,
}

impl UnauthenticatedTest {
    pub fn new(client: Arc<dyn OnvifClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TierTest for UnauthenticatedTest {
    fn name(&self) -> &'static str {
        "unauthenticated"
    }

    async fn attempt(&self, device: &Device) -> Result<()> {
        self.client.system_date_and_time(device).await
    }
}

/// TCP connect to the device endpoint, falling back to a plain HTTP GET.
pub struct TransportTest {
    timeout: Duration,
    http: reqwest::Client,
}

impl TransportTest {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { timeout, http })
    }

    async fn tcp_connect(&self, endpoint: &str, deadline: Instant) -> Result<()> {
        let addrs = tokio::time::timeout_at(deadline, lookup_host(endpoint))
            .await
            .map_err(|_| timed_out("address lookup"))??;

        let mut last_err = timed_out("no addresses");
        for addr in addrs {
            match tokio::time::timeout_at(deadline, TcpDialer.dial(addr)).await {
                Ok(Ok(_stream)) => return Ok(()),
                Ok(Err(e)) => last_err = DiscoverError::Transport(e),
                Err(_) => return Err(timed_out("connect")),
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl TierTest for TransportTest {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn attempt(&self, device: &Device) -> Result<()> {
        let endpoint = device.endpoint().ok_or_else(|| {
            DiscoverError::NotApplicable(format!("device {} has no network address", device.name))
        })?;

        // Both attempts share one timeout budget.
        let deadline = Instant::now() + self.timeout;
        let err = match self.tcp_connect(&endpoint, deadline).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::trace!(device = %device.name, error = %err, "TCP connect failed, trying HTTP");

        // Any HTTP answer, error statuses included, proves a listener.
        tokio::time::timeout_at(deadline, self.http.get(format!("http://{endpoint}/")).send())
            .await
            .map_err(|_| timed_out("http"))?
            .map(|_| ())
            .map_err(DiscoverError::from)
    }
}

fn timed_out(what: &str) -> DiscoverError {
    DiscoverError::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        what.to_string(),
    ))
}

/// Outcome of checking one device.
#[derive(Debug, Clone)]
pub struct DeviceCheck {
    pub name: String,
    pub status: ReachabilityStatus,
    /// Tier replaced by this check. `None` if the write was rejected.
    pub previous: Option<ReachabilityTier>,
}

/// Per-pass health-check totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub pass_id: Uuid,
    pub checked: u32,
    pub up_with_auth: u32,
    pub up_without_auth: u32,
    pub reachable: u32,
    pub unreachable: u32,
    pub write_failures: u32,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl HealthSummary {
    fn count(&mut self, tier: ReachabilityTier) {
        self.checked += 1;
        match tier {
            ReachabilityTier::UpWithAuth => self.up_with_auth += 1,
            ReachabilityTier::UpWithoutAuth => self.up_without_auth += 1,
            ReachabilityTier::Reachable => self.reachable += 1,
            ReachabilityTier::Unreachable => self.unreachable += 1,
        }
    }

    /// Devices that answered at any tier.
    pub fn responsive(&self) -> u32 {
        self.up_with_auth + self.up_without_auth + self.reachable
    }
}

/// Runs the tier ladder and records the result in the inventory.
pub struct ConnectionProber {
    tiers: Vec<(Arc<dyn TierTest>, ReachabilityTier)>,
    inventory: Arc<dyn Inventory>,
    events: Option<broadcast::Sender<LookoutEvent>>,
}

impl ConnectionProber {
    /// Build a prober from an explicit table, strongest tier first.
    pub fn new(
        tiers: Vec<(Arc<dyn TierTest>, ReachabilityTier)>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        Self {
            tiers,
            inventory,
            events: None,
        }
    }

    /// The standard authenticated → unauthenticated → transport ladder.
    pub fn standard(
        client: Arc<dyn OnvifClient>,
        secrets: Arc<dyn SecretStore>,
        inventory: Arc<dyn Inventory>,
        transport_timeout: Duration,
    ) -> Result<Self> {
        let auth: Arc<dyn TierTest> = Arc::new(AuthenticatedTest::new(client.clone(), secrets));
        let noauth: Arc<dyn TierTest> = Arc::new(UnauthenticatedTest::new(client));
        let transport: Arc<dyn TierTest> = Arc::new(TransportTest::new(transport_timeout)?);
        let tiers = vec![
            (auth, ReachabilityTier::UpWithAuth),
            (noauth, ReachabilityTier::UpWithoutAuth),
            (transport, ReachabilityTier::Reachable),
        ];
        Ok(Self::new(tiers, inventory))
    }

    /// Publish tier changes and pass completions on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<LookoutEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Determine the strongest tier `device` supports. Never fails.
    pub async fn probe(&self, device: &Device) -> ReachabilityStatus {
        let tier = if device.endpoint().is_none() {
            tracing::warn!(device = %device.name, "Device has no network address, cannot probe");
            ReachabilityTier::Unreachable
        } else {
            self.strongest_tier(device).await
        };
        ReachabilityStatus {
            tier,
            checked_at: Utc::now(),
        }
    }

    async fn strongest_tier(&self, device: &Device) -> ReachabilityTier {
        for (test, tier) in &self.tiers {
            match test.attempt(device).await {
                Ok(()) => return *tier,
                Err(e) => tracing::debug!(
                    device = %device.name,
                    test = test.name(),
                    error = %e,
                    "Connection test failed"
                ),
            }
        }
        ReachabilityTier::Unreachable
    }

    /// Probe one device and record the outcome.
    ///
    /// A rejected write is logged and leaves the stored tier unchanged.
    pub async fn check_device(&self, device: &Device) -> DeviceCheck {
        let status = self.probe(device).await;

        let previous = match self
            .inventory
            .record_reachability(&device.name, status.clone())
            .await
        {
            Ok(previous) => Some(previous),
            Err(e) => {
                tracing::warn!(
                    device = %device.name,
                    tier = %status.tier,
                    error = %e,
                    "Could not update device status"
                );
                None
            }
        };

        if let Some(previous) = previous.filter(|p| *p != status.tier) {
            tracing::info!(
                device = %device.name,
                previous = %previous,
                tier = %status.tier,
                "Reachability tier changed"
            );
            self.publish(EventPayload::TierChanged {
                name: device.name.clone(),
                previous,
                current: status.tier,
            });
        }

        DeviceCheck {
            name: device.name.clone(),
            status,
            previous,
        }
    }

    /// Check every device in turn, stopping early if `cancel` fires.
    pub async fn check_all(&self, devices: &[Device], cancel: &CancellationToken) -> HealthSummary {
        let start = Instant::now();
        let mut summary = HealthSummary {
            pass_id: Uuid::new_v4(),
            ..Default::default()
        };
        tracing::debug!(pass_id = %summary.pass_id, devices = devices.len(), "Checking device statuses");

        for device in devices {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let check = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                check = self.check_device(device) => check,
            };
            summary.count(check.status.tier);
            if check.previous.is_none() {
                summary.write_failures += 1;
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            pass_id = %summary.pass_id,
            checked = summary.checked,
            up_with_auth = summary.up_with_auth,
            up_without_auth = summary.up_without_auth,
            reachable = summary.reachable,
            unreachable = summary.unreachable,
            write_failures = summary.write_failures,
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "Health check complete"
        );
        self.publish(EventPayload::HealthCheckCompleted {
            pass_id: summary.pass_id,
            checked: summary.checked,
            reachable: summary.responsive(),
            unreachable: summary.unreachable,
            write_failures: summary.write_failures,
            duration_ms: summary.duration_ms,
        });
        summary
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(LookoutEvent::new(EventSource::HealthCheck, payload));
        }
    }
}
