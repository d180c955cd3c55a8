//! Periodic backend health sweeps.
//!
//! Every backend is TCP-dialed on a fixed interval; the elapsed dial time is
//! recorded as latency whether or not the connect succeeds, and liveness
//! follows the outcome. One `HealthStatus` event per backend per sweep is
//! published to a bounded channel; a full channel drops the event rather than
//! stalling the sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::proxy::{Backend, ServerPool};

/// Interval between sweeps. Sweeps never overlap; a long sweep delays the
/// next tick.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Probe connect deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Events queued before the sweep starts dropping them.
pub const EVENT_BUFFER: usize = 64;

/// One probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub url: String,
    pub alive: bool,
    pub latency: Duration,
}

/// The bounded event channel shared by the sweep and its consumer.
pub fn channel() -> (mpsc::Sender<HealthStatus>, mpsc::Receiver<HealthStatus>) {
    mpsc::channel(EVENT_BUFFER)
}

/// Runs sweeps forever, starting one interval from now.
pub async fn run(pool: Arc<ServerPool>, events: mpsc::Sender<HealthStatus>) {
    let mut ticker = interval_at(tokio::time::Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        debug!("Health check starting");
        sweep(&pool, &events).await;
        debug!("Health check finished");
    }
}

/// Probes every pool member once, updating liveness and latency and
/// publishing an event per backend.
pub async fn sweep(pool: &ServerPool, events: &mpsc::Sender<HealthStatus>) {
    for backend in pool.snapshot() {
        let (alive, latency) = probe(&backend).await;
        backend.set_alive(alive);
        backend.set_latency(latency);

        let status = HealthStatus {
            url: backend.url().to_string(),
            alive,
            latency,
        };
        if let Err(err) = events.try_send(status) {
            warn!(error = %err, "Health event dropped");
        }
    }
    pool.purge_dead_sessions();
}

async fn probe(backend: &Backend) -> (bool, Duration) {
    let (host, port) = backend.probe_addr();
    let start = Instant::now();
    let alive = matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await,
        Ok(Ok(_))
    );
    (alive, start.elapsed())
}

/// Consumes health events and logs them. Alerting and metrics hang off this
/// sink.
pub async fn run_sink(mut events: mpsc::Receiver<HealthStatus>) {
    while let Some(status) = events.recv().await {
        info!(
            url = %status.url,
            alive = status.alive,
            latency_ms = status.latency.as_millis() as u64,
            "Backend health update"
        );
    }
}
