use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tether_core::config::Config;
use tether_core::discovery::lan::LanDiscovery;
use tether_core::discovery::memory::MemoryDiscovery;
use tether_core::discovery::{DiscoveryEvent, Peer, PeerDiscoveryService, PeerId, PeerRole};
use tether_core::session::{ConnectionPhase, SessionHandle};
use tether_core::signaling::SignalingChannel;
use tether_core::telemetry::logging::{LogConfig, LogLevel};
use tether_core::transport::webrtc::WebRtcTransport;
use transport_bus::LocalBus;
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Peer-to-peer video link for devices on the same network")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true, env = "TETHER_LOG_LEVEL")]
    pub log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Print Prometheus metrics on exit")]
    pub metrics: bool,

    #[arg(long, global = true, help = "Name shown to the other device")]
    pub name: Option<String>,

    #[arg(long, global = true)]
    pub service_type: Option<String>,

    #[arg(long, global = true)]
    pub discovery_port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Advertise on the LAN and stream to the first viewer that connects
    Host,
    /// Find a host on the LAN and print link telemetry
    View,
    /// Run host and viewer in-process with a synthetic stream
    Demo {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig::from_env(self.log_level, self.log_file.clone())
    }

    /// Flags win over the environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(service_type) = &self.service_type {
            config.service_type = service_type.clone();
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    cli.apply(&mut config);
    tracing::debug!(target = "cli", ?config, command = ?cli.command, "starting");

    match cli.command {
        Command::Host => run_lan(config, PeerRole::Host).await,
        Command::View => run_lan(config, PeerRole::Viewer).await,
        Command::Demo { seconds } => run_demo(config, Duration::from_secs(seconds)).await,
    }
}

async fn run_lan(config: Config, role: PeerRole) -> Result<()> {
    let local = Peer::new(PeerId::random(), config.display_name.clone(), role);
    let backend = Arc::new(LanDiscovery::new(config.lan_config()));
    let discovery = PeerDiscoveryService::new(local, config.discovery_config(), backend);
    let mut events = discovery
        .take_events()
        .context("discovery events already taken")?;

    match role {
        PeerRole::Host => discovery.start_advertising().await?,
        PeerRole::Viewer => discovery.start_browsing().await?,
    }
    println!(
        "{} as {role} on service {}; press Ctrl-C to quit",
        match role {
            PeerRole::Host => "advertising",
            PeerRole::Viewer => "browsing",
        },
        config.service_type
    );

    let channel = tokio::select! {
        channel = wait_for_session(&mut events) => channel?,
        _ = tokio::signal::ctrl_c() => {
            discovery.stop().await;
            return Ok(());
        }
    };
    discovery.cancel_invitations();
    discovery.stop().await;
    println!("paired with {}", channel.peer().display_name);

    let transport = Arc::new(WebRtcTransport::new(config.webrtc_config(role)).await?);
    if let Some(track) = transport.local_video_track() {
        tracing::info!(
            target = "cli",
            track = %track.id(),
            stream = %track.stream_id(),
            "local video track ready for the capture pipeline"
        );
    }
    let session = SessionHandle::spawn(config.session_config(role), transport, channel)?;
    session.start();
    follow_session(&session, role == PeerRole::Viewer, None).await;
    session.close().await;
    Ok(())
}

async fn run_demo(config: Config, duration: Duration) -> Result<()> {
    let bus = Arc::new(LocalBus::new());
    let host = PeerDiscoveryService::new(
        Peer::new(
            PeerId::random(),
            format!("{} (host)", config.display_name),
            PeerRole::Host,
        ),
        config.discovery_config(),
        Arc::new(MemoryDiscovery::new(Arc::clone(&bus), config.service_type.clone())),
    );
    let viewer = PeerDiscoveryService::new(
        Peer::new(
            PeerId::random(),
            format!("{} (viewer)", config.display_name),
            PeerRole::Viewer,
        ),
        config.discovery_config(),
        Arc::new(MemoryDiscovery::new(Arc::clone(&bus), config.service_type.clone())),
    );
    let mut host_events = host.take_events().context("host events already taken")?;
    let mut viewer_events = viewer
        .take_events()
        .context("viewer events already taken")?;

    host.start_advertising().await?;
    viewer.start_browsing().await?;
    let (host_channel, viewer_channel) = tokio::try_join!(
        wait_for_session(&mut host_events),
        wait_for_session(&mut viewer_events)
    )?;
    host.stop().await;
    viewer.stop().await;

    let host_transport = Arc::new(WebRtcTransport::new(config.webrtc_config(PeerRole::Host)).await?);
    let viewer_transport =
        Arc::new(WebRtcTransport::new(config.webrtc_config(PeerRole::Viewer)).await?);
    let feed = host_transport
        .local_video_track()
        .map(|track| tokio::spawn(synthetic_feed(track)));

    let host_session = SessionHandle::spawn(
        config.session_config(PeerRole::Host),
        host_transport,
        host_channel,
    )?;
    let viewer_session = SessionHandle::spawn(
        config.session_config(PeerRole::Viewer),
        viewer_transport,
        viewer_channel,
    )?;
    viewer_session.start();
    host_session.start();

    follow_session(&viewer_session, true, Some(duration)).await;

    if let Some(feed) = feed {
        feed.abort();
    }
    viewer_session.close().await;
    host_session.close().await;
    Ok(())
}

async fn wait_for_session(
    events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
) -> Result<SignalingChannel> {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::PeerFound(peer) => {
                let role = peer.role.map(PeerRole::as_str).unwrap_or("unknown");
                println!("found {} ({role})", peer.display_name);
            }
            DiscoveryEvent::PeerLost(id) => tracing::info!(target = "cli", peer = %id, "peer lost"),
            DiscoveryEvent::InvitationAbandoned { peer, reason } => {
                println!("invitation to {peer} abandoned: {reason}");
            }
            DiscoveryEvent::Error(message) => eprintln!("discovery error: {message}"),
            DiscoveryEvent::SessionReady(channel) => return Ok(channel),
        }
    }
    bail!("discovery stopped before a session was established")
}

/// Prints phase changes (and telemetry when asked) until the session fails,
/// the deadline passes, or the user interrupts.
async fn follow_session(session: &SessionHandle, print_telemetry: bool, deadline: Option<Duration>) {
    let mut phase = session.subscribe_phase();
    let mut telemetry = session.subscribe_telemetry();
    let sleep = tokio::time::sleep(deadline.unwrap_or(Duration::MAX));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = phase.borrow_and_update().clone();
                println!("phase: {current}");
                if current.is_terminal() {
                    break;
                }
            }
            changed = telemetry.changed(), if print_telemetry => {
                if changed.is_err() {
                    break;
                }
                println!("{}", telemetry.borrow_and_update().summary);
            }
            _ = &mut sleep, if deadline.is_some() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    if let ConnectionPhase::Failed { reason } = session.phase() {
        eprintln!("session failed: {reason}");
    }
}

/// Roughly 30 fps of fake IDR slices so the demo viewer has something to
/// count.
async fn synthetic_feed(track: Arc<TrackLocalStaticSample>) {
    let frame_interval = Duration::from_millis(33);
    let mut interval = tokio::time::interval(frame_interval);
    let mut frame = vec![0u8; 4096];
    frame[..5].copy_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
    let frame = Bytes::from(frame);
    loop {
        interval.tick().await;
        let sample = Sample {
            data: frame.clone(),
            duration: frame_interval,
            ..Default::default()
        };
        if let Err(err) = track.write_sample(&sample).await {
            tracing::debug!(target = "cli", error = %err, "synthetic frame dropped");
        }
    }
}
