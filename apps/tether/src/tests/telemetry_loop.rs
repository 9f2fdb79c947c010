use std::time::Duration;

use super::{eventually, reach_phase, viewer_with_remote};
use crate::session::{ConnectionPhase, SessionHandle};
use crate::signaling::{SessionDescription, SignalingChannel};
use crate::telemetry::{Metric, TelemetrySnapshot};
use crate::transport::TransportState;
use crate::transport::mock::{MockCall, MockCounters, MockTransportHandle};

async fn connected_viewer() -> (SessionHandle, MockTransportHandle, SignalingChannel) {
    let (viewer, transport, remote) = viewer_with_remote();
    viewer.start();
    remote.send(&SessionDescription::offer("v=0").into());
    reach_phase(&viewer, |phase| matches!(phase, ConnectionPhase::Negotiating { .. })).await;
    transport.set_state(TransportState::Connected);
    reach_phase(&viewer, |phase| *phase == ConnectionPhase::Connected).await;
    (viewer, transport, remote)
}

fn counters(frames: u64, bytes: u64) -> MockCounters {
    MockCounters {
        frames_decoded: frames,
        bytes_received: bytes,
        jitter_seconds: Some(0.004),
        round_trip_time_seconds: Some(0.02),
    }
}

async fn samples(session: &SessionHandle, count: u64) -> TelemetrySnapshot {
    let mut telemetry = session.subscribe_telemetry();
    let snapshot = telemetry
        .wait_for(|snapshot| snapshot.samples >= count)
        .await
        .expect("session actor alive")
        .clone();
    snapshot
}

fn stats_queries(transport: &MockTransportHandle) -> usize {
    transport.count(|call| *call == MockCall::Stats)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn each_tick_folds_one_sample_into_the_snapshot() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    transport.push_stats(counters(30, 125_000));
    transport.push_stats(counters(60, 250_000));

    let snapshot = samples(&viewer, 3).await;
    assert_eq!(snapshot.samples, 3);
    assert!((snapshot.fps - 30.0).abs() < 0.01);
    assert!((snapshot.bitrate_kbps - 1000.0).abs() < 0.01);
    assert!((snapshot.latency_ms - 20.0).abs() < 0.01);
    assert_eq!(snapshot.summary, "FPS: 30 | 1.0 Mbps | Latency: 20 ms");

    let timestamps: Vec<f64> = snapshot.history.iter().map(|point| point.timestamp).collect();
    assert_eq!(timestamps, vec![-1.0, 0.0, 1.0, 2.0]);
    assert_eq!(snapshot.history[0].fps, 0.0);
    viewer.close().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failed_stats_queries_skip_the_tick() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats_error("stats unavailable");
    transport.push_stats(counters(0, 0));
    transport.push_stats(counters(24, 50_000));

    let snapshot = samples(&viewer, 2).await;
    assert!(stats_queries(&transport) >= 3);
    assert_eq!(snapshot.samples, 2);
    // the first good sample sets the origin
    assert_eq!(snapshot.history.last().map(|point| point.timestamp), Some(1.0));
    assert!((snapshot.bitrate_kbps - 400.0).abs() < 0.01);
    viewer.close().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn close_stops_the_ticker_and_is_idempotent() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    samples(&viewer, 1).await;

    viewer.close().await;
    viewer.close().await;
    assert_eq!(viewer.phase(), ConnectionPhase::Closed);
    assert_eq!(transport.count(|call| *call == MockCall::Close), 1);

    let queried = stats_queries(&transport);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(stats_queries(&transport), queried);
    eventually(|| viewer.is_finished()).await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn dropping_the_handle_closes_the_session() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    samples(&viewer, 1).await;

    drop(viewer);
    eventually(|| transport.count(|call| *call == MockCall::Close) == 1).await;
    let queried = stats_queries(&transport);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(stats_queries(&transport), queried);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failure_stops_the_ticker() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    samples(&viewer, 1).await;

    transport.set_state(TransportState::Failed);
    reach_phase(&viewer, ConnectionPhase::is_terminal).await;
    let queried = stats_queries(&transport);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(stats_queries(&transport), queried);
    assert_eq!(viewer.telemetry().samples, 1);
    viewer.close().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reconnecting_keeps_the_same_ticker() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    samples(&viewer, 1).await;

    transport.set_state(TransportState::Disconnected);
    reach_phase(&viewer, |phase| *phase == ConnectionPhase::Disconnected).await;
    transport.set_state(TransportState::Connected);
    reach_phase(&viewer, |phase| *phase == ConnectionPhase::Connected).await;

    transport.push_stats(counters(30, 10_000));
    let snapshot = samples(&viewer, 2).await;
    assert_eq!(snapshot.samples, 2);
    viewer.close().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn selected_metric_drives_the_chart_series() {
    let (viewer, transport, _remote) = connected_viewer().await;
    transport.push_stats(counters(0, 0));
    transport.push_stats(counters(30, 125_000));
    samples(&viewer, 2).await;

    viewer.select_metric(Metric::Latency);
    let mut telemetry = viewer.subscribe_telemetry();
    let snapshot = telemetry
        .wait_for(|snapshot| snapshot.metric == Metric::Latency)
        .await
        .unwrap()
        .clone();
    let series = snapshot.chart_series();
    assert_eq!(series.len(), snapshot.history.len());
    assert_eq!(series.last().map(|(_, value)| *value), Some(snapshot.latency_ms));
    viewer.close().await;
}
