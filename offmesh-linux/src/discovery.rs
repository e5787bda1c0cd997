//! LAN discovery: UDP multicast beacon, parse beacons/responses, maintain peer list.
//! Scanning pauses while a dial is in flight and resumes on request.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use offmesh_core::wire::{decode_frame, encode_frame};
use offmesh_core::{DeviceId, DiscoveryControl, Message, PROTOCOL_VERSION, SERVICE_ID};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// A device advertising the service on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: DeviceId,
    pub name: String,
    /// Where its session listener accepts calls.
    pub addr: SocketAddr,
}

struct PeerState {
    name: String,
    addr: SocketAddr,
    last_seen: Instant,
}

/// What to do after a datagram was processed.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    None,
    Respond,
}

pub struct Discovery {
    device_id: DeviceId,
    device_name: String,
    transport_port: u16,
    scanning: AtomicBool,
    peers: Mutex<HashMap<DeviceId, PeerState>>,
}

impl Discovery {
    pub fn new(device_id: DeviceId, device_name: String, transport_port: u16) -> Self {
        Self {
            device_id,
            device_name,
            transport_port,
            scanning: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Resume scanning after a dial paused it.
    pub fn resume(&self) {
        if !self.scanning.swap(true, Ordering::SeqCst) {
            info!("discovery resumed");
        }
    }

    /// Known peers, ordered by name then id so list positions are stable between calls.
    pub async fn peers(&self) -> Vec<DiscoveredPeer> {
        let p = self.peers.lock().await;
        let mut out: Vec<DiscoveredPeer> = p
            .iter()
            .map(|(id, s)| DiscoveredPeer {
                device_id: *id,
                name: s.name.clone(),
                addr: s.addr,
            })
            .collect();
        out.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.device_id.as_bytes().cmp(b.device_id.as_bytes()))
        });
        out
    }

    fn beacon(&self) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            device_id: self.device_id,
            device_name: self.device_name.clone(),
            service: SERVICE_ID.uuid(),
            listen_port: self.transport_port,
        }
    }

    fn response(&self) -> Message {
        Message::DiscoveryResponse {
            protocol_version: PROTOCOL_VERSION,
            device_id: self.device_id,
            device_name: self.device_name.clone(),
            service: SERVICE_ID.uuid(),
            listen_port: self.transport_port,
        }
    }

    async fn observe(&self, msg: Message, from: SocketAddr, now: Instant) -> Reply {
        if msg.device_id() == self.device_id {
            return Reply::None;
        }
        let (is_beacon, device_id, name, listen_port) = match msg {
            Message::Leave { device_id } => {
                if self.peers.lock().await.remove(&device_id).is_some() {
                    info!(peer = %device_id, "peer left");
                }
                return Reply::None;
            }
            Message::Beacon {
                protocol_version,
                service,
                ..
            }
            | Message::DiscoveryResponse {
                protocol_version,
                service,
                ..
            } if protocol_version != PROTOCOL_VERSION || service != SERVICE_ID.uuid() => {
                return Reply::None;
            }
            Message::Beacon {
                device_id,
                device_name,
                listen_port,
                ..
            } => (true, device_id, device_name, listen_port),
            Message::DiscoveryResponse {
                device_id,
                device_name,
                listen_port,
                ..
            } => (false, device_id, device_name, listen_port),
        };
        let addr = SocketAddr::new(from.ip(), listen_port);
        let is_new = {
            let mut p = self.peers.lock().await;
            match p.get_mut(&device_id) {
                Some(known) => {
                    known.name = name.clone();
                    known.addr = addr;
                    known.last_seen = now;
                    false
                }
                // Paused: known peers stay fresh, new ones wait for the next scan.
                None if !self.is_scanning() => false,
                None => {
                    p.insert(
                        device_id,
                        PeerState {
                            name: name.clone(),
                            addr,
                            last_seen: now,
                        },
                    );
                    true
                }
            }
        };
        if is_new {
            info!(peer = %device_id, %name, %addr, "peer discovered");
        }
        if is_beacon {
            Reply::Respond
        } else {
            Reply::None
        }
    }

    /// Drop peers not heard from within the timeout. Returns the dropped ids.
    async fn expire(&self, now: Instant) -> Vec<DeviceId> {
        let mut p = self.peers.lock().await;
        let list: Vec<DeviceId> = p
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &list {
            p.remove(id);
        }
        list
    }
}

impl DiscoveryControl for Discovery {
    fn cancel_discovery(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            debug!("discovery paused for dial");
        }
    }
}

/// Running discovery loops plus the socket they share.
pub struct DiscoveryTask {
    discovery: Arc<Discovery>,
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryTask {
    /// Tell peers we are leaving, then stop the loops.
    pub async fn shutdown(self) {
        let leave = Message::Leave {
            device_id: self.discovery.device_id,
        };
        match encode_frame(&leave) {
            Ok(frame) => {
                if let Err(e) = self.socket.send_to(&frame, self.group).await {
                    debug!(error = %e, "leave not sent");
                }
            }
            Err(e) => warn!(error = %e, "encode leave"),
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind the multicast socket and spawn the beacon, receive and timeout loops.
pub fn spawn(
    discovery: Arc<Discovery>,
    discovery_port: u16,
) -> std::io::Result<DiscoveryTask> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let group = SocketAddr::new(MULTICAST_GROUP.into(), discovery_port);
    info!(%group, device = %discovery.device_id, "discovery started");

    let tasks = vec![
        tokio::spawn(supervise(
            "beacon",
            beacon_loop(socket.clone(), discovery.clone(), group),
        )),
        tokio::spawn(supervise(
            "recv",
            recv_loop(socket.clone(), discovery.clone()),
        )),
        tokio::spawn(supervise("timeout", peer_timeout_loop(discovery.clone()))),
    ];
    Ok(DiscoveryTask {
        discovery,
        socket,
        group,
        tasks,
    })
}

async fn supervise(name: &'static str, run: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = run.await {
        warn!(task = name, error = %e, "discovery loop failed");
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    discovery: Arc<Discovery>,
    group: SocketAddr,
) -> std::io::Result<()> {
    let frame = encode_frame(&discovery.beacon()).map_err(invalid_data)?;
    loop {
        if let Err(e) = socket.send_to(&frame, group).await {
            debug!(error = %e, "beacon not sent");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, discovery: Arc<Discovery>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let response_frame = encode_frame(&discovery.response()).map_err(invalid_data)?;
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let msg = match decode_frame(&buf[..n]) {
            Ok((msg, _)) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        if discovery.observe(msg, from, Instant::now()).await == Reply::Respond {
            if let Err(e) = socket.send_to(&response_frame, from).await {
                debug!(%from, error = %e, "response not sent");
            }
        }
    }
}

async fn peer_timeout_loop(discovery: Arc<Discovery>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        for peer in discovery.expire(Instant::now()).await {
            info!(%peer, "peer timed out");
        }
    }
}
