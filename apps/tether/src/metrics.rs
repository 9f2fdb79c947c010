use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SIGNALING_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_signaling_messages_total",
            "Signaling envelopes sent or received",
        ),
        &["direction", "kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNALING_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_signaling_dropped_total",
            "Signaling messages dropped before reaching the peer or the controller",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PHASE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_phase_transitions_total",
            "Connection phase transitions",
        ),
        &["from", "to"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static NEGOTIATION_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_negotiation_errors_total",
            "Failures applying or producing session descriptions and candidates",
        ),
        &["stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INVITATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_invitations_total",
            "Session invitations by outcome",
        ),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static VISIBLE_PEERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tether_visible_peers", "Peers currently visible to discovery").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static TELEMETRY_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_telemetry_ticks_total",
            "Telemetry ticks by outcome of their stats query",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TELEMETRY_STARTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "tether_telemetry_starts_total",
        "Times telemetry collection was started by a connected transition",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
