//! LAN discovery: UDP broadcast beacons for presence, TCP for invitations
//! and the session byte pipe.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::{BackendEvent, DiscoveryBackend, DiscoveryError, DiscoveryInfo, Peer, PeerId, SessionLink};

pub const DEFAULT_DISCOVERY_PORT: u16 = 47810;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LanConfig {
    pub service_type: String,
    pub discovery_port: u16,
    pub broadcast_addr: IpAddr,
    pub beacon_interval: Duration,
    /// A peer whose beacons stop for this long is reported lost.
    pub peer_timeout: Duration,
}

impl LanConfig {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            beacon_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_millis(3500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Beacon {
    service: String,
    peer_id: PeerId,
    name: String,
    info: DiscoveryInfo,
    session_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct Invitation {
    peer_id: PeerId,
    name: String,
    info: DiscoveryInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct InvitationReply {
    accepted: bool,
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame; `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(io::Error::other)?;
    write_frame(writer, &payload).await
}

async fn read_json<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let frame = read_frame(reader)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "session closed"))?;
    serde_json::from_slice(&frame).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Runs the framed pumps for an established TCP session.
fn link_from_stream(stream: TcpStream, remote: Peer) -> SessionLink {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let peer_id = remote.id.clone();

    tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &payload).await {
                tracing::debug!(target = "discovery::lan", error = %err, "session write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(target = "discovery::lan", peer = %peer_id, error = %err, "session read failed");
                    break;
                }
            }
        }
    });

    SessionLink {
        peer: remote,
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

#[derive(Default)]
struct LanTasks {
    beacon: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
    browse: Option<JoinHandle<()>>,
}

/// Session endpoints of peers currently heard on the network.
type Directory = Arc<Mutex<HashMap<PeerId, SocketAddr>>>;

pub struct LanDiscovery {
    config: LanConfig,
    tasks: Mutex<LanTasks>,
    directory: Directory,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
}

impl LanDiscovery {
    pub fn new(config: LanConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            tasks: Mutex::new(LanTasks::default()),
            directory: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

async fn accept_invitations(listener: TcpListener, events: mpsc::UnboundedSender<BackendEvent>) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(target = "discovery::lan", error = %err, "accept failed");
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            let invitation: Invitation = match read_json(&mut stream).await {
                Ok(invitation) => invitation,
                Err(err) => {
                    tracing::debug!(target = "discovery::lan", %addr, error = %err, "bad invitation");
                    return;
                }
            };
            if let Err(err) = write_json(&mut stream, &InvitationReply { accepted: true }).await {
                tracing::debug!(target = "discovery::lan", %addr, error = %err, "failed to answer invitation");
                return;
            }
            let remote =
                Peer::from_advertisement(invitation.peer_id, invitation.name, &invitation.info);
            tracing::info!(target = "discovery::lan", peer = %remote.id, %addr, "accepted invitation");
            let _ = events.send(BackendEvent::Incoming(link_from_stream(stream, remote)));
        });
    }
}

async fn send_beacons(socket: UdpSocket, target: SocketAddr, beacon: Vec<u8>, every: Duration) {
    let mut interval = time::interval(every);
    loop {
        interval.tick().await;
        if let Err(err) = socket.send_to(&beacon, target).await {
            tracing::debug!(target = "discovery::lan", error = %err, "beacon send failed");
        }
    }
}

async fn listen_for_beacons(
    socket: UdpSocket,
    config: LanConfig,
    local_id: PeerId,
    directory: Directory,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let mut last_seen: HashMap<PeerId, Instant> = HashMap::new();
    let mut sweep = time::interval(config.peer_timeout / 4);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::debug!(target = "discovery::lan", error = %err, "beacon receive failed");
                        continue;
                    }
                };
                let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..len]) else {
                    continue;
                };
                if beacon.service != config.service_type || beacon.peer_id == local_id {
                    continue;
                }
                let session_addr = SocketAddr::new(from.ip(), beacon.session_port);
                directory.lock().insert(beacon.peer_id.clone(), session_addr);
                if last_seen.insert(beacon.peer_id.clone(), Instant::now()).is_none() {
                    let found = BackendEvent::Found {
                        id: beacon.peer_id,
                        display_name: beacon.name,
                        info: beacon.info,
                    };
                    if events.send(found).is_err() {
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<PeerId> = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= config.peer_timeout)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    last_seen.remove(&id);
                    directory.lock().remove(&id);
                    if events.send(BackendEvent::Lost(id)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryBackend for LanDiscovery {
    async fn start_advertising(&self, local: &Peer) -> Result<(), DiscoveryError> {
        if self.tasks.lock().beacon.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|err| DiscoveryError::Advertise(err.to_string()))?;
        let session_port = listener
            .local_addr()
            .map_err(|err| DiscoveryError::Advertise(err.to_string()))?
            .port();

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|err| DiscoveryError::Advertise(err.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|err| DiscoveryError::Advertise(err.to_string()))?;
        let beacon = serde_json::to_vec(&Beacon {
            service: self.config.service_type.clone(),
            peer_id: local.id.clone(),
            name: local.display_name.clone(),
            info: local.discovery_info(),
            session_port,
        })
        .map_err(|err| DiscoveryError::Advertise(err.to_string()))?;
        let target = SocketAddr::new(self.config.broadcast_addr, self.config.discovery_port);

        let mut tasks = self.tasks.lock();
        tasks.accept = Some(tokio::spawn(accept_invitations(
            listener,
            self.events_tx.clone(),
        )));
        tasks.beacon = Some(tokio::spawn(send_beacons(
            socket,
            target,
            beacon,
            self.config.beacon_interval,
        )));
        tracing::info!(
            target = "discovery::lan",
            peer = %local.id,
            session_port,
            %target,
            "advertising"
        );
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut tasks = self.tasks.lock();
        for task in [tasks.beacon.take(), tasks.accept.take()].into_iter().flatten() {
            task.abort();
        }
    }

    async fn start_browsing(&self, local: &Peer) -> Result<(), DiscoveryError> {
        if self.tasks.lock().browse.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.discovery_port))
            .await
            .map_err(|err| DiscoveryError::Browse(err.to_string()))?;
        let task = tokio::spawn(listen_for_beacons(
            socket,
            self.config.clone(),
            local.id.clone(),
            Arc::clone(&self.directory),
            self.events_tx.clone(),
        ));
        self.tasks.lock().browse = Some(task);
        tracing::info!(
            target = "discovery::lan",
            peer = %local.id,
            port = self.config.discovery_port,
            "browsing"
        );
        Ok(())
    }

    async fn stop_browsing(&self) {
        if let Some(task) = self.tasks.lock().browse.take() {
            task.abort();
        }
        self.directory.lock().clear();
    }

    async fn invite(&self, local: &Peer, remote: &Peer) -> Result<SessionLink, DiscoveryError> {
        let addr = self
            .directory
            .lock()
            .get(&remote.id)
            .copied()
            .ok_or_else(|| DiscoveryError::UnknownPeer(remote.id.clone()))?;
        let failed = |err: io::Error| DiscoveryError::Invitation {
            peer: remote.id.clone(),
            reason: err.to_string(),
        };
        let mut stream = TcpStream::connect(addr).await.map_err(failed)?;
        write_json(
            &mut stream,
            &Invitation {
                peer_id: local.id.clone(),
                name: local.display_name.clone(),
                info: local.discovery_info(),
            },
        )
        .await
        .map_err(failed)?;
        let reply: InvitationReply = read_json(&mut stream).await.map_err(failed)?;
        if !reply.accepted {
            return Err(DiscoveryError::Declined(remote.id.clone()));
        }
        Ok(link_from_stream(stream, remote.clone()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.lock().take()
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [tasks.beacon.take(), tasks.accept.take(), tasks.browse.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}
