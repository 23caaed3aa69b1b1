//! Discovery pipeline: multicast and/or netscan probes, conversion to
//! discovery records, reconciliation and provisioning.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lookout_core::events::{EventPayload, EventSource, LookoutEvent};
use lookout_core::{AuthMode, Device, DiscoveredRecord};
use lookout_store::{get_credentials_with_retry, Inventory, SecretStore};

use crate::config::{DiscoverConfig, DiscoveryMode};
use crate::error::{DiscoverError, Result};
use crate::netscan::{self, ProbeResult, ProtocolDiscovery, ScanParams, UdpDialer};
use crate::onvif::{DeviceInformation, OnvifClient};
use crate::reconcile::{self, ProvisionDefaults, ReconcileSummary};
use crate::wsdiscovery::{onvif_probe, parse_responses, EndpointDescriptor, MULTICAST_GROUP};

/// Label attached to every device created by discovery.
pub const DISCOVERY_LABEL: &str = "auto-discovery";

const MAX_DATAGRAM: usize = 65_535;

// ── Multicast ─────────────────────────────────────────────────────

/// UDP socket for sending the multicast probe, optionally pinned to the
/// interface owning `interface`. TTL 1 keeps the probe on the local link.
pub fn create_multicast_socket(interface: Option<Ipv4Addr>) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let bind = SocketAddr::from((interface.unwrap_or(Ipv4Addr::UNSPECIFIED), 0));
    socket.bind(&bind.into())?;
    if let Some(iface) = interface {
        socket.set_multicast_if_v4(&iface)?;
    }
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Send one ONVIF probe to the WS-Discovery multicast group and collect
/// replies until `window` elapses or `cancel` fires.
pub async fn discover_multicast(
    cancel: &CancellationToken,
    interface: Option<Ipv4Addr>,
    window: Duration,
) -> Result<Vec<EndpointDescriptor>> {
    let socket = UdpSocket::from_std(create_multicast_socket(interface)?)?;
    let message_id = Uuid::new_v4();
    socket
        .send_to(onvif_probe(message_id).as_bytes(), SocketAddr::V4(MULTICAST_GROUP))
        .await
        .map_err(DiscoverError::Transport)?;

    Ok(collect_replies(&socket, message_id, Instant::now() + window, cancel).await)
}

/// Read probe replies from `socket` until `deadline` or `cancel`. Replies
/// whose `RelatesTo` names a different probe than `message_id` are dropped.
pub async fn collect_replies(
    socket: &UdpSocket,
    message_id: Uuid,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<EndpointDescriptor> {
    let expected = format!("uuid:{message_id}");
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut found = Vec::new();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = timeout_at(deadline, socket.recv_from(&mut buf)) => r,
        };
        let (len, from) = match received {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "UDP receive error during multicast discovery");
                break;
            }
            Err(_) => break,
        };
        for mut endpoint in parse_responses(&[&buf[..len]]) {
            if endpoint.relates_to.as_deref().is_some_and(|id| id != expected) {
                tracing::debug!(from = %from, "Ignoring reply to another probe");
                continue;
            }
            endpoint.responder = Some(from);
            found.push(endpoint);
        }
    }

    found
}

// ── Netscan hook ──────────────────────────────────────────────────

/// Unicast WS-Discovery over a connected UDP socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnvifDiscovery;

#[async_trait]
impl ProtocolDiscovery<UdpSocket> for OnvifDiscovery {
    type Output = EndpointDescriptor;

    async fn on_dialed(
        &self,
        host: IpAddr,
        port: u16,
        conn: &mut UdpSocket,
        deadline: Instant,
    ) -> Result<Vec<ProbeResult<EndpointDescriptor>>> {
        conn.send(onvif_probe(Uuid::new_v4()).as_bytes())
            .await
            .map_err(DiscoverError::Transport)?;

        // Several devices may answer through one address, so keep reading
        // until the deadline rather than stopping at the first reply.
        let mut payloads = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match timeout_at(deadline, conn.recv(&mut buf)).await {
                Ok(Ok(len)) => payloads.push(buf[..len].to_vec()),
                Ok(Err(e)) if payloads.is_empty() => return Err(DiscoverError::Transport(e)),
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let responder = SocketAddr::new(host, port);
        Ok(parse_responses(&payloads)
            .into_iter()
            .map(|mut endpoint| {
                endpoint.responder = Some(responder);
                ProbeResult {
                    host,
                    port,
                    data: endpoint,
                }
            })
            .collect())
    }
}

// ── Conversion ────────────────────────────────────────────────────

/// Turn a probe match into a discovery record.
///
/// The address comes from the first XAddr, falling back to the responder
/// on port 80. Endpoints without an identity token are rejected.
pub fn to_record(endpoint: &EndpointDescriptor) -> Result<DiscoveredRecord> {
    let address = endpoint
        .device_address()
        .or_else(|| endpoint.fallback_host().map(|h| (h, 80)));

    let Some(identity) = endpoint.identity.clone() else {
        return Err(DiscoverError::MissingIdentity {
            address: address
                .map(|(host, port)| format!("{host}:{port}"))
                .unwrap_or_else(|| "<unknown>".to_string()),
        });
    };
    let Some((address, port)) = address else {
        return Err(DiscoverError::ProtocolParse(format!(
            "endpoint {identity} advertised no usable address"
        )));
    };

    let mut record = DiscoveredRecord::new(Some(identity), address, port);
    record.xaddr = endpoint.xaddrs.first().cloned();
    record.scopes = endpoint.scopes.clone();
    Ok(record)
}

// ── Enrichment ────────────────────────────────────────────────────

/// Resolves names and metadata for newly discovered devices.
pub struct Enricher {
    client: Arc<dyn OnvifClient>,
    secrets: Arc<dyn SecretStore>,
    defaults: ProvisionDefaults,
    retry_interval: Duration,
    max_wait: Duration,
}

impl Enricher {
    pub fn new(
        client: Arc<dyn OnvifClient>,
        secrets: Arc<dyn SecretStore>,
        defaults: ProvisionDefaults,
        retry_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            client,
            secrets,
            defaults,
            retry_interval,
            max_wait,
        }
    }

    /// Query `GetDeviceInformation` with the default secret reference, then
    /// with the identity token as the reference, and name the record from
    /// the answer. Without an answer the record keeps its token name.
    pub async fn enrich(&self, record: &mut DiscoveredRecord) {
        let Some(token) = record.identity.clone() else {
            return;
        };
        let mut probe = Device::new(token.as_str(), &record.address, record.port);
        probe.auth_mode = self.defaults.auth_mode;

        let mut answer = None;
        if probe.auth_mode == AuthMode::None {
            answer = self.query(&probe, None).await.map(|info| (info, None));
        } else {
            for secret_ref in [self.defaults.secret_ref.as_str(), token.as_str()] {
                if let Some(info) = self.query(&probe, Some(secret_ref)).await {
                    answer = Some((info, Some(secret_ref.to_string())));
                    break;
                }
            }
        }

        match answer {
            Some((info, secret_ref)) => {
                record.name = device_name(&info, token.as_str());
                record.description = Some(format!("{} {} Camera", info.manufacturer, info.model));
                record.labels = vec![
                    DISCOVERY_LABEL.to_string(),
                    info.manufacturer.clone(),
                    info.model.clone(),
                ];
                record.metadata = info.to_metadata();
                record.secret_ref = secret_ref;
                tracing::debug!(device = %record.name, address = %record.address, "Discovered camera");
            }
            None => {
                tracing::warn!(
                    identity = %token,
                    address = %record.address,
                    "Failed to get the device information for the camera"
                );
                record.name = token.to_string();
                record.description = Some("Auto discovered Onvif camera".to_string());
                record.labels = vec![DISCOVERY_LABEL.to_string()];
            }
        }
    }

    /// Wait up to the configured credential window for the default secret
    /// to appear. Called once per pass; `enrich` itself never waits.
    pub async fn await_default_secret(&self) -> bool {
        if self.defaults.auth_mode == AuthMode::None {
            return true;
        }
        match get_credentials_with_retry(
            self.secrets.as_ref(),
            &self.defaults.secret_ref,
            self.retry_interval,
            self.max_wait,
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    secret_ref = %self.defaults.secret_ref,
                    error = %e,
                    "Default credentials unavailable, enriching without them"
                );
                false
            }
        }
    }

    async fn query(&self, device: &Device, secret_ref: Option<&str>) -> Option<DeviceInformation> {
        let creds = match secret_ref {
            Some(secret_ref) => match self.secrets.get_credentials(secret_ref).await {
                Ok(creds) => Some(creds),
                Err(e) => {
                    tracing::debug!(secret_ref = %secret_ref, error = %e, "No credentials for discovered device");
                    return None;
                }
            },
            None => None,
        };

        match self.client.device_information(device, creds.as_ref()).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(address = %device.address, error = %e, "GetDeviceInformation failed");
                None
            }
        }
    }
}

/// `<Manufacturer>-<Model>-<token>`, with spaces replaced by dashes.
pub fn device_name(info: &DeviceInformation, token: &str) -> String {
    format!(
        "{}-{}-{}",
        info.manufacturer.replace(' ', "-"),
        info.model.replace(' ', "-"),
        token
    )
}

// ── Pass ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverySummary {
    pub pass_id: Uuid,
    pub multicast_found: u32,
    pub netscan_found: u32,
    /// Endpoints dropped before reconciliation for lack of an identity.
    pub missing_identity: u32,
    pub reconcile: ReconcileSummary,
    pub created: u32,
    pub updated: u32,
    pub write_failures: u32,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// One complete discovery pass.
pub struct DiscoveryPass {
    mode: DiscoveryMode,
    scan: ScanParams,
    multicast_window: Duration,
    interface: Option<Ipv4Addr>,
    defaults: ProvisionDefaults,
    inventory: Arc<dyn Inventory>,
    enricher: Enricher,
    events: Option<broadcast::Sender<LookoutEvent>>,
}

impl DiscoveryPass {
    pub fn new(
        config: &DiscoverConfig,
        inventory: Arc<dyn Inventory>,
        client: Arc<dyn OnvifClient>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let defaults = ProvisionDefaults {
            auth_mode: config.default_auth_mode,
            secret_ref: config.default_secret_ref.clone(),
        };
        Self {
            mode: config.discovery_mode,
            scan: ScanParams {
                subnets: config.discovery_subnets.clone(),
                ports: config.netscan_ports.clone(),
                timeout: config.probe_timeout(),
                concurrency: config.probe_async_limit,
            },
            multicast_window: config.probe_timeout(),
            interface: config.discovery_interface_addr,
            enricher: Enricher::new(
                client,
                secrets,
                defaults.clone(),
                config.credentials_retry(),
                config.credentials_wait(),
            ),
            defaults,
            inventory,
            events: None,
        }
    }

    /// Publish discovery events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<LookoutEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Probe, reconcile and provision. Failures are logged; the summary
    /// reports what was achieved.
    pub async fn run(&self, cancel: &CancellationToken) -> DiscoverySummary {
        let start = Instant::now();
        let mut summary = DiscoverySummary {
            pass_id: Uuid::new_v4(),
            ..Default::default()
        };
        tracing::info!(pass_id = %summary.pass_id, mode = ?self.mode, "Discovery pass started");

        let mut endpoints = Vec::new();
        if self.mode.uses_multicast() {
            match discover_multicast(cancel, self.interface, self.multicast_window).await {
                Ok(found) => {
                    summary.multicast_found = found.len() as u32;
                    tracing::info!(found = found.len(), "Discovered devices via multicast");
                    endpoints.extend(found);
                }
                Err(e) => tracing::warn!(error = %e, "Multicast discovery failed"),
            }
        }
        if self.mode.uses_netscan() && !cancel.is_cancelled() {
            endpoints.extend(self.netscan(cancel, &mut summary).await);
        }

        let mut records = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            match to_record(endpoint) {
                Ok(record) => records.push(record),
                Err(e @ DiscoverError::MissingIdentity { .. }) => {
                    tracing::warn!(error = %e, "Unable to add discovered camera");
                    summary.missing_identity += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Unable to add discovered camera"),
            }
        }

        let inventory = match self.inventory.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "Could not list inventory, skipping reconciliation");
                return self.finish(summary, start, cancel);
            }
        };

        let mut outcome = reconcile::reconcile(records, &inventory);
        if !outcome.new_records.is_empty() && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.enricher.await_default_secret() => {}
            }
        }
        for record in &mut outcome.new_records {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.enricher.enrich(record) => {}
            }
        }

        let report = reconcile::apply(&outcome, self.inventory.as_ref(), &self.defaults).await;
        summary.reconcile = outcome.summary;
        summary.created = report.created.len() as u32;
        summary.updated = report.updated.len() as u32;
        summary.write_failures = report.write_failures;

        for device in &report.created {
            if let Some(identity) = device.identity.clone() {
                self.publish(EventPayload::DeviceDiscovered {
                    name: device.name.clone(),
                    identity,
                    address: device.address.clone(),
                    port: device.port,
                });
            }
        }
        for device in &report.updated {
            if let Some(identity) = device.identity.clone() {
                self.publish(EventPayload::DeviceRelocated {
                    name: device.name.clone(),
                    identity,
                    address: device.address.clone(),
                    port: device.port,
                });
            }
        }

        self.finish(summary, start, cancel)
    }

    async fn netscan(
        &self,
        cancel: &CancellationToken,
        summary: &mut DiscoverySummary,
    ) -> Vec<EndpointDescriptor> {
        if self.scan.subnets.iter().all(|s| s.trim().is_empty()) {
            tracing::debug!("Netscan not performed, discovery_subnets is empty");
            return Vec::new();
        }

        match netscan::scan(
            cancel.clone(),
            &self.scan,
            Arc::new(UdpDialer),
            Arc::new(OnvifDiscovery),
        )
        .await
        {
            Ok(results) => {
                summary.netscan_found = results.len() as u32;
                tracing::info!(found = results.len(), "Discovered devices via netscan");
                results.into_iter().map(|r| r.data).collect()
            }
            Err(e) => {
                tracing::error!(error = %e, "Netscan discovery failed");
                Vec::new()
            }
        }
    }

    fn finish(
        &self,
        mut summary: DiscoverySummary,
        start: Instant,
        cancel: &CancellationToken,
    ) -> DiscoverySummary {
        summary.cancelled = cancel.is_cancelled();
        summary.duration_ms = start.elapsed().as_millis() as u64;
        if summary.cancelled {
            tracing::warn!(pass_id = %summary.pass_id, "Discover process has been cancelled");
        }
        tracing::info!(
            pass_id = %summary.pass_id,
            multicast_found = summary.multicast_found,
            netscan_found = summary.netscan_found,
            created = summary.created,
            updated = summary.updated,
            rejected = summary.reconcile.rejected + summary.missing_identity,
            write_failures = summary.write_failures,
            duration_ms = summary.duration_ms,
            "Discovery pass complete"
        );
        self.publish(EventPayload::DiscoveryCompleted {
            pass_id: summary.pass_id,
            found: summary.multicast_found + summary.netscan_found,
            created: summary.created,
            updated: summary.updated,
            rejected: summary.reconcile.rejected + summary.missing_identity,
            duration_ms: summary.duration_ms,
        });
        summary
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(tx) = &self.events {
            let _ = tx.send(LookoutEvent::new(EventSource::Discovery, payload));
        }
    }
}
