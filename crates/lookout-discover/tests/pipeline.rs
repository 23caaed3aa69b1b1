//! End-to-end discovery against a fake camera on loopback.
//!
//! Run with: cargo test --package lookout-discover --test pipeline

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use lookout_core::events::EventPayload;
use lookout_core::{Device, OperatingState};
use lookout_discover::config::{self, DiscoverConfig, DiscoveryMode};
use lookout_discover::discovery::{DiscoveryPass, DISCOVERY_LABEL};
use lookout_discover::onvif::{DeviceInformation, OnvifClient};
use lookout_discover::{DiscoverError, Result};
use lookout_store::{Credentials, Inventory, MemoryInventory, StaticSecretStore};

/// Camera whose HTTP side never answers.
struct Offline;

#[async_trait]
impl OnvifClient for Offline {
    async fn device_information(
        &self,
        _device: &Device,
        _credentials: Option<&Credentials>,
    ) -> Result<DeviceInformation> {
        Err(DiscoverError::NotApplicable("offline".to_string()))
    }

    async fn system_date_and_time(&self, _device: &Device) -> Result<()> {
        Err(DiscoverError::NotApplicable("offline".to_string()))
    }
}

fn probe_matches() -> String {
    let matched = |token: &str, xaddr: &str| {
        format!(
            r#"<d:ProbeMatch>
      <wsa:EndpointReference><wsa:Address>{token}</wsa:Address></wsa:EndpointReference>
      <d:Types>dn:NetworkVideoTransmitter</d:Types>
      <d:Scopes>onvif://www.onvif.org/name/Gate%20Cam</d:Scopes>
      <d:XAddrs>{xaddr}</d:XAddrs>
      <d:MetadataVersion>1</d:MetadataVersion>
    </d:ProbeMatch>"#
        )
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing"
    xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <s:Header/>
  <s:Body><d:ProbeMatches>{}{}</d:ProbeMatches></s:Body>
</s:Envelope>"#,
        matched("urn:uuid:known-cam", "http://127.0.0.1:8080/onvif/device_service"),
        matched("urn:uuid:new-cam", "http://127.0.0.1/onvif/device_service"),
    )
}

/// Answer every probe with the same ProbeMatches payload.
async fn spawn_fake_camera() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let reply = probe_matches();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((_, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(reply.as_bytes(), from).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_netscan_discovery_relocates_and_provisions() {
    let camera = spawn_fake_camera().await;
    let discover_config = DiscoverConfig {
        discovery_mode: DiscoveryMode::Netscan,
        discovery_subnets: vec!["127.0.0.1/32".to_string()],
        netscan_ports: vec![camera.port()],
        probe_timeout_ms: 300,
        probe_async_limit: 4,
        credentials_wait_secs: 0,
        ..Default::default()
    };

    let mut known = Device::new("gate", "10.9.9.9", 80).with_identity("urn:uuid:known-cam".parse().unwrap());
    known.operating_state = OperatingState::Down;
    let inventory = Arc::new(MemoryInventory::with_devices([known]));

    let (tx, mut rx) = broadcast::channel(64);
    let pass = DiscoveryPass::new(
        &discover_config,
        inventory.clone(),
        Arc::new(Offline),
        Arc::new(StaticSecretStore::default()),
    )
    .with_events(tx);

    let first = pass.run(&CancellationToken::new()).await;
    assert_eq!(first.netscan_found, 2);
    assert_eq!(first.created, 1);
    assert_eq!(first.updated, 1);
    assert_eq!(first.write_failures, 0);

    let gate = inventory.get_device("gate").await.unwrap();
    assert_eq!((gate.address.as_str(), gate.port), ("127.0.0.1", 8080));
    assert_eq!(gate.operating_state, OperatingState::Up);

    let created = inventory.get_device("urn:uuid:new-cam").await.unwrap();
    assert_eq!(created.port, 80);
    assert_eq!(created.secret_ref, "credentials001");
    assert_eq!(created.labels, vec![DISCOVERY_LABEL.to_string()]);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match event.payload {
            EventPayload::DeviceDiscovered { .. } => "discovered",
            EventPayload::DeviceRelocated { .. } => "relocated",
            EventPayload::DiscoveryCompleted { .. } => "completed",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["discovered", "relocated", "completed"]);

    // Same replies again: nothing left to write.
    let second = pass.run(&CancellationToken::new()).await;
    assert_eq!(second.netscan_found, 2);
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.reconcile.unchanged, 2);
    assert_eq!(inventory.list_devices().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_pass_writes_nothing() {
    let discover_config = DiscoverConfig {
        discovery_mode: DiscoveryMode::Netscan,
        discovery_subnets: vec!["127.0.0.1/32".to_string()],
        ..Default::default()
    };
    let inventory = Arc::new(MemoryInventory::new());
    let pass = DiscoveryPass::new(
        &discover_config,
        inventory.clone(),
        Arc::new(Offline),
        Arc::new(StaticSecretStore::default()),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = pass.run(&cancel).await;

    assert!(summary.cancelled);
    assert_eq!(summary.created, 0);
    assert!(inventory.is_empty().await);
}

#[test]
fn test_load_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lookout.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[discover]
discovery_mode = "both"
discovery_subnets = ["192.168.10.0/24"]
probe_timeout_ms = 1500
check_status_interval_secs = 900

[[discover.devices]]
name = "gate"
address = "192.168.10.20"
identity = "urn:uuid:gate"

[discover.credentials.credentials001]
username = "admin"
password = "secret"
"#
    )
    .unwrap();

    let loaded = config::load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.discovery_mode, DiscoveryMode::Both);
    assert_eq!(loaded.discovery_subnets, vec!["192.168.10.0/24"]);
    assert_eq!(loaded.probe_timeout_ms, 1500);
    assert_eq!(loaded.check_status_interval_secs, 900);
    assert_eq!(loaded.probe_async_limit, 4000);
    assert_eq!(loaded.credentials["credentials001"].username, "admin");

    let devices = loaded.static_devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].port, 80);
    assert_eq!(devices[0].secret_ref, "credentials001");
}

#[test]
fn test_load_config_rejects_bad_subnet() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[discover]\ndiscovery_subnets = [\"10.0.0.0/99\"]\n").unwrap();

    let err = config::load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, DiscoverError::Config(_)));
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("absent");
    let loaded = config::load(prefix.to_str().unwrap()).unwrap();
    assert_eq!(loaded.discovery_mode, DiscoveryMode::Multicast);
    assert!(loaded.devices.is_empty());
}
