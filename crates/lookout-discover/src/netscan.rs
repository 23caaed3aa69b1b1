//! Concurrent subnet scanner.
//!
//! Every host of every configured subnet is crossed with every port and
//! dialed by a fixed-size pool of tokio tasks. Candidates come from a lazy
//! generator shared by the workers, so memory use does not grow with the
//! size of the subnets. A successful dial is handed to a protocol hook
//! which decides whether a device is really there.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::parse_subnets;
use crate::error::{DiscoverError, Result};

/// Extra time a protocol hook gets past the dial deadline before it is
/// abandoned. Hooks are expected to honor the deadline themselves.
const HOOK_GRACE: Duration = Duration::from_millis(250);

/// Parameters for one scan pass.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// CIDR subnets, e.g. "192.168.1.0/24".
    pub subnets: Vec<String>,
    pub ports: Vec<u16>,
    /// Budget for dialing one candidate and running the hook on it.
    pub timeout: Duration,
    /// Number of workers.
    pub concurrency: usize,
}

/// Transport-level outcome of one scan attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult<T> {
    pub host: IpAddr,
    pub port: u16,
    /// Protocol-specific payload produced by the hook.
    pub data: T,
}

/// Opens connections for the scanner.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Connect to `addr`. The scanner bounds this call with its own timeout.
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<Self::Conn>;
}

/// Protocol-specific hooks invoked by the scanner.
#[async_trait]
pub trait ProtocolDiscovery<C: Send>: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Called once per host with the candidate ports; returns the ports to
    /// actually dial. An empty result skips the host.
    fn probe_filter(&self, _host: IpAddr, ports: &[u16]) -> Vec<u16> {
        ports.to_vec()
    }

    /// Verify whether a device answers on a freshly dialed connection.
    ///
    /// Must finish by `deadline`. The scanner closes the connection after
    /// the hook returns.
    async fn on_dialed(
        &self,
        host: IpAddr,
        port: u16,
        conn: &mut C,
        deadline: Instant,
    ) -> Result<Vec<ProbeResult<Self::Output>>>;
}

/// Connected UDP sockets, one per candidate. Dialing never touches the
/// network; the hook's first write does.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    type Conn = UdpSocket;

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

/// Plain TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

type CandidateIter = Box<dyn Iterator<Item = (IpAddr, u16)> + Send>;

/// Lazily enumerate `(host, port)` pairs, consulting `filter` once per host.
pub fn candidates<F>(nets: Vec<IpNet>, ports: Vec<u16>, mut filter: F) -> CandidateIter
where
    F: FnMut(IpAddr, &[u16]) -> Vec<u16> + Send + 'static,
{
    Box::new(
        nets.into_iter()
            .flat_map(|net| net.hosts())
            .flat_map(move |host| {
                let wanted = filter(host, &ports);
                if wanted.is_empty() {
                    tracing::trace!(host = %host, "Host skipped by probe filter");
                }
                wanted.into_iter().map(move |port| (host, port))
            }),
    )
}

/// Number of host addresses `nets` will produce, saturating.
pub fn host_count(nets: &[IpNet]) -> u128 {
    nets.iter().fold(0u128, |total, net| {
        let bits = u32::from(net.max_prefix_len() - net.prefix_len());
        let mut count = 1u128.checked_shl(bits).unwrap_or(u128::MAX);
        if matches!(net, IpNet::V4(_)) && net.prefix_len() < 31 {
            count -= 2;
        }
        total.saturating_add(count)
    })
}

/// Scan `params.subnets` × `params.ports` and collect whatever the hook
/// reports.
///
/// Refused, timed-out and unreachable candidates contribute nothing.
/// Cancelling `cancel` makes the call return promptly with the results
/// gathered so far; cancellation is not an error. Only invalid parameters
/// fail the call, and they do so before anything is dialed.
pub async fn scan<D, P>(
    cancel: CancellationToken,
    params: &ScanParams,
    dialer: Arc<D>,
    discovery: Arc<P>,
) -> Result<Vec<ProbeResult<P::Output>>>
where
    D: Dialer,
    P: ProtocolDiscovery<D::Conn>,
{
    if params.concurrency == 0 {
        return Err(DiscoverError::Config(
            "scan concurrency must be greater than zero".to_string(),
        ));
    }
    if params.ports.is_empty() {
        return Err(DiscoverError::Config("no ports to scan".to_string()));
    }
    let nets = parse_subnets(&params.subnets)?;
    if nets.is_empty() {
        tracing::debug!("Scan skipped, no subnets configured");
        return Ok(Vec::new());
    }

    let start = Instant::now();
    tracing::info!(
        subnets = ?params.subnets,
        ports = ?params.ports,
        hosts = %host_count(&nets),
        concurrency = params.concurrency,
        timeout_ms = params.timeout.as_millis() as u64,
        "Starting network scan"
    );

    let filter_hook = discovery.clone();
    let generator = candidates(nets, params.ports.clone(), move |host, ports| {
        filter_hook.probe_filter(host, ports)
    });
    let generator = Arc::new(Mutex::new(generator));

    let mut workers = JoinSet::new();
    for _ in 0..params.concurrency {
        workers.spawn(run_worker(
            cancel.clone(),
            generator.clone(),
            dialer.clone(),
            discovery.clone(),
            params.timeout,
        ));
    }

    let mut results = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(found) => results.extend(found),
            Err(e) => tracing::error!(error = %e, "Scan worker panicked"),
        }
    }

    if cancel.is_cancelled() {
        tracing::warn!(
            found = results.len(),
            "Network scan cancelled, returning partial results"
        );
    }
    tracing::info!(
        found = results.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Network scan complete"
    );
    Ok(results)
}

async fn run_worker<D, P>(
    cancel: CancellationToken,
    generator: Arc<Mutex<CandidateIter>>,
    dialer: Arc<D>,
    discovery: Arc<P>,
    timeout: Duration,
) -> Vec<ProbeResult<P::Output>>
where
    D: Dialer,
    P: ProtocolDiscovery<D::Conn>,
{
    let mut found = Vec::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut candidates = generator
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            candidates.next()
        };
        let Some((host, port)) = next else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            results = probe_candidate(dialer.as_ref(), discovery.as_ref(), host, port, timeout) => {
                found.extend(results);
            }
        }
    }
    found
}

async fn probe_candidate<D, P>(
    dialer: &D,
    discovery: &P,
    host: IpAddr,
    port: u16,
    timeout: Duration,
) -> Vec<ProbeResult<P::Output>>
where
    D: Dialer,
    P: ProtocolDiscovery<D::Conn>,
{
    let addr = SocketAddr::new(host, port);
    let deadline = Instant::now() + timeout;

    let mut conn = match timeout_at(deadline, dialer.dial(addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            tracing::trace!(addr = %addr, error = %e, "No device: dial failed");
            return Vec::new();
        }
        Err(_) => {
            tracing::trace!(addr = %addr, "No device: dial timed out");
            return Vec::new();
        }
    };

    let outcome = timeout_at(
        deadline + HOOK_GRACE,
        discovery.on_dialed(host, port, &mut conn, deadline),
    )
    .await;
    drop(conn);

    match outcome {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            tracing::debug!(addr = %addr, error = %e, "Protocol hook rejected connection");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!(addr = %addr, "Protocol hook overran its deadline");
            Vec::new()
        }
    }
}
