use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::discovery::PeerRole;
use crate::metrics;
use crate::signaling::{SignalingChannel, SignalingEnvelope};
use crate::telemetry::{Metric, TelemetryAggregator, TelemetryConfig, TelemetrySnapshot};
use crate::transport::{MediaTransport, RemoteVideo, StatSample, TransportError, TransportEvent};

pub mod controller;
pub mod phase;

pub use controller::{CandidatePolicy, ConnectionController, Effect};
pub use phase::ConnectionPhase;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: PeerRole,
    pub candidate_policy: CandidatePolicy,
    pub telemetry: TelemetryConfig,
}

impl SessionConfig {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            candidate_policy: CandidatePolicy::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

enum Input {
    Start,
    Close(oneshot::Sender<()>),
    Signal(SignalingEnvelope),
    SignalingClosed,
    Transport(TransportEvent),
    Tick(u64),
    Stats {
        generation: u64,
        result: Result<StatSample, TransportError>,
    },
    SelectMetric(Metric),
}

/// Handle to a running session actor.
///
/// The actor owns the [`ConnectionController`] and the
/// [`TelemetryAggregator`]; signaling, transport callbacks, ticks and stats
/// completions all reach it through one ordered queue. Readers observe the
/// published phase, telemetry and remote video through watch channels.
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    phase: watch::Receiver<ConnectionPhase>,
    telemetry: watch::Receiver<TelemetrySnapshot>,
    remote_video: watch::Receiver<Option<RemoteVideo>>,
    last_error: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn MediaTransport>,
        channel: SignalingChannel,
    ) -> Result<Self, TransportError> {
        let transport_events = transport
            .take_events()
            .ok_or_else(|| TransportError::Setup("transport events already taken".into()))?;
        let peer = channel.peer().clone();
        let (sender, mut receiver) = channel.split();

        let controller = ConnectionController::new(
            config.role,
            Arc::clone(&transport),
            sender,
            config.candidate_policy,
        );
        let phase = controller.subscribe_phase();
        let remote_video = controller.subscribe_remote_video();
        let (telemetry_tx, telemetry) = watch::channel(TelemetrySnapshot::default());
        let (error_tx, last_error) = watch::channel(None);
        let (inputs, queue) = mpsc::unbounded_channel();

        let signal_tx = inputs.clone();
        let signaling_forwarder = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if signal_tx.send(Input::Signal(envelope)).is_err() {
                    return;
                }
            }
            let _ = signal_tx.send(Input::SignalingClosed);
        });

        let transport_tx = inputs.clone();
        let transport_forwarder = tokio::spawn(async move {
            let mut events = transport_events;
            while let Some(event) = events.recv().await {
                if transport_tx.send(Input::Transport(event)).is_err() {
                    return;
                }
            }
        });

        tracing::info!(
            target = "session",
            peer = %peer.id,
            name = %peer.display_name,
            role = %config.role,
            "session actor started"
        );

        let actor = SessionActor {
            controller,
            aggregator: TelemetryAggregator::new(config.telemetry),
            transport,
            inputs: inputs.clone(),
            telemetry_tx,
            error_tx,
            ticker: None,
            generation: 0,
            forwarders: vec![signaling_forwarder, transport_forwarder],
        };
        let task = tokio::spawn(actor.run(queue));

        Ok(Self {
            inputs,
            phase,
            telemetry,
            remote_video,
            last_error,
            task,
        })
    }

    /// Starts session setup: the host sends its offer, the viewer waits
    /// for one. Repeated calls are no-ops.
    pub fn start(&self) {
        let _ = self.inputs.send(Input::Start);
    }

    /// Closes the transport and stops telemetry. Returns once the actor has
    /// processed the close; calling it again is a no-op.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inputs.send(Input::Close(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn select_metric(&self, metric: Metric) {
        let _ = self.inputs.send(Input::SelectMetric(metric));
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.borrow().clone()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.telemetry.clone()
    }

    pub fn remote_video(&self) -> Option<RemoteVideo> {
        self.remote_video.borrow().clone()
    }

    pub fn subscribe_remote_video(&self) -> watch::Receiver<Option<RemoteVideo>> {
        self.remote_video.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Dropping the handle closes the session. The actor holds a sender to its
/// own queue, so the queue alone never closes.
impl Drop for SessionHandle {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.inputs.send(Input::Close(ack));
    }
}

struct SessionActor {
    controller: ConnectionController,
    aggregator: TelemetryAggregator,
    transport: Arc<dyn MediaTransport>,
    inputs: mpsc::UnboundedSender<Input>,
    telemetry_tx: watch::Sender<TelemetrySnapshot>,
    error_tx: watch::Sender<Option<String>>,
    ticker: Option<JoinHandle<()>>,
    /// Bumped on every telemetry start and stop so late ticks and stats
    /// completions from a cancelled ticker can be told apart.
    generation: u64,
    forwarders: Vec<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = queue.recv().await {
            match input {
                Input::Start => self.controller.start().await,
                Input::Close(ack) => {
                    let effect = self.controller.close().await;
                    self.apply(effect);
                    self.publish_error();
                    let _ = ack.send(());
                    break;
                }
                Input::Signal(envelope) => self.controller.handle_envelope(envelope).await,
                Input::SignalingClosed => {
                    tracing::debug!(
                        target = "session",
                        "signaling session ended; transport keeps running"
                    );
                }
                Input::Transport(event) => {
                    let effect = self.controller.handle_transport_event(event);
                    self.apply(effect);
                }
                Input::Tick(generation) => self.on_tick(generation),
                Input::Stats { generation, result } => self.on_stats(generation, result),
                Input::SelectMetric(metric) => {
                    self.aggregator.select_metric(metric);
                    self.telemetry_tx.send_replace(self.aggregator.snapshot());
                }
            }
            self.publish_error();
        }
        self.stop_telemetry();
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }

    fn apply(&mut self, effect: Option<Effect>) {
        match effect {
            Some(Effect::StartTelemetry) => self.start_telemetry(),
            Some(Effect::StopTelemetry) => self.stop_telemetry(),
            None => {}
        }
    }

    fn start_telemetry(&mut self) {
        self.stop_telemetry();
        self.aggregator.restart();
        let generation = self.generation;
        let period = self.aggregator.config().period;
        let inputs = self.inputs.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if inputs.send(Input::Tick(generation)).is_err() {
                    return;
                }
            }
        }));
        metrics::TELEMETRY_STARTS.inc();
        tracing::info!(target = "telemetry", ?period, "telemetry started");
    }

    fn stop_telemetry(&mut self) {
        self.generation += 1;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            tracing::info!(target = "telemetry", "telemetry stopped");
        }
    }

    fn on_tick(&mut self, generation: u64) {
        if self.ticker.is_none() || generation != self.generation {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = transport.stats().await;
            let _ = inputs.send(Input::Stats { generation, result });
        });
    }

    fn on_stats(&mut self, generation: u64, result: Result<StatSample, TransportError>) {
        if self.ticker.is_none() || generation != self.generation {
            return;
        }
        match result {
            Ok(sample) => {
                if self.aggregator.ingest(sample) {
                    metrics::TELEMETRY_TICKS
                        .with_label_values(&["sampled"])
                        .inc();
                    let snapshot = self.aggregator.snapshot();
                    tracing::trace!(target = "telemetry", summary = %snapshot.summary, "sample");
                    self.telemetry_tx.send_replace(snapshot);
                } else {
                    metrics::TELEMETRY_TICKS
                        .with_label_values(&["stale"])
                        .inc();
                }
            }
            Err(err) => {
                metrics::TELEMETRY_TICKS
                    .with_label_values(&["failed"])
                    .inc();
                tracing::debug!(target = "telemetry", error = %err, "stats query failed; skipping tick");
            }
        }
    }

    fn publish_error(&self) {
        let current = self.controller.last_error().map(str::to_owned);
        self.error_tx.send_if_modified(|slot| {
            if *slot == current {
                false
            } else {
                *slot = current;
                true
            }
        });
    }
}
