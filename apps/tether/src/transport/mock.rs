use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    MediaTransport, NegotiationOptions, StatSample, TransportError, TransportEvent, TransportState,
};
use crate::signaling::{IceCandidate, SessionDescription};

/// Calls observed by a [`MockTransport`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateOffer(NegotiationOptions),
    CreateAnswer(NegotiationOptions),
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Stats,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
}

/// Counter values handed out by the next stats query.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MockCounters {
    pub frames_decoded: u64,
    pub bytes_received: u64,
    pub jitter_seconds: Option<f64>,
    pub round_trip_time_seconds: Option<f64>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    failures: Vec<MockOp>,
    stats: VecDeque<Result<MockCounters, TransportError>>,
    gathered: Vec<IceCandidate>,
}

/// Scriptable transport for exercising the controller without a network.
///
/// Setting a local description "gathers" the candidates configured with
/// [`MockTransportHandle::gather_on_local_description`], mirroring how a real
/// transport only starts gathering once it has a local description.
pub struct MockTransport {
    label: String,
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// Test-side controls for a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new(label: impl Into<String>) -> (Self, MockTransportHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockState::default()));
        let transport = Self {
            label: label.into(),
            state: Arc::clone(&state),
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
        };
        (transport, MockTransportHandle { state, events_tx })
    }

    fn record(&self, call: MockCall, op: Option<MockOp>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(op) = op {
            if let Some(pos) = state.failures.iter().position(|failing| *failing == op) {
                state.failures.remove(pos);
                return Err(TransportError::Negotiation(format!(
                    "{} scripted failure for {op:?}",
                    self.label
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateOffer(options), Some(MockOp::CreateOffer))?;
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateAnswer(options), Some(MockOp::CreateAnswer))?;
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(MockCall::SetLocal(desc), Some(MockOp::SetLocal))?;
        let gathered = std::mem::take(&mut self.state.lock().gathered);
        for candidate in gathered {
            let _ = self.events_tx.send(TransportEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetRemote(desc), Some(MockOp::SetRemote))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(MockCall::AddCandidate(candidate), Some(MockOp::AddCandidate))
    }

    async fn stats(&self) -> Result<StatSample, TransportError> {
        let next = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Stats);
            state.stats.pop_front()
        };
        let counters = next.unwrap_or_else(|| Err(TransportError::Stats("no counters scripted".into())))?;
        Ok(StatSample {
            frames_decoded: counters.frames_decoded,
            bytes_received: counters.bytes_received,
            jitter_seconds: counters.jitter_seconds,
            round_trip_time_seconds: counters.round_trip_time_seconds,
            sampled_at: Instant::now(),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(MockCall::Close, None)?;
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(TransportState::Closed));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

impl MockTransportHandle {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    pub fn gather_on_local_description(&self, candidates: Vec<IceCandidate>) {
        self.state.lock().gathered = candidates;
    }

    pub fn fail_next(&self, op: MockOp) {
        self.state.lock().failures.push(op);
    }

    pub fn push_stats(&self, counters: MockCounters) {
        self.state.lock().stats.push_back(Ok(counters));
    }

    pub fn push_stats_error(&self, reason: &str) {
        self.state
            .lock()
            .stats
            .push_back(Err(TransportError::Stats(reason.to_string())));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }
}
