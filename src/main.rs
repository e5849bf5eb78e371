//! Gridrush Netcode Demo Server
//!
//! Runs the authoritative tick loop with the reference simulation and two
//! in-process predictive clients, then reports telemetry.
//!
//! Usage: `gridrush-server [config.json]`. `GRIDRUSH_*` variables override
//! the file; `RUST_LOG` controls log output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridrush::{
    client::PredictiveClient,
    config::NetcodeConfig,
    core::{rng::DeterministicRng, time::{Clock, SystemClock}},
    game::{
        events::{SharedSink, TracingObserver},
        input::{ActionCode, ActionPayload, InputPayload, PlaceArrowPayload},
        simulation::GridSimulation,
        state::Direction,
    },
    network::{delta::DeltaCompressor, server::{AuthoritativeServer, ServerCore}},
    telemetry,
    VERSION,
};

/// Demo match length.
const DEMO_DURATION: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => NetcodeConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => NetcodeConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;

    info!("Gridrush Netcode v{}", VERSION);
    info!("Tick Rate: {} Hz", config.server.tick_rate);
    info!("Full snapshot every {} ticks", config.server.full_snapshot_interval);

    run_demo(config).await
}

async fn run_demo(config: NetcodeConfig) -> anyhow::Result<()> {
    let sink: SharedSink = Arc::new(TracingObserver);
    let clock = SystemClock;

    let simulation = GridSimulation::new(config.simulation.clone());
    let initial = simulation.initial_snapshot();
    let core = ServerCore::new(config.server.clone(), config.delta.clone(), simulation, initial, sink.clone());
    let mut server = AuthoritativeServer::new(core);
    let handle = server.handle();

    let mut frames = server.subscribe();
    server.start()?;

    let mut clients = Vec::new();
    for (id, name) in [(1, "ada"), (2, "bo")] {
        handle.add_player(id, name).await?;
        clients.push(PredictiveClient::new(id, config.client.clone(), sink.clone()));
    }

    for client in &mut clients {
        let ready = InputPayload::Action(ActionPayload { code: ActionCode::Ready as u32 });
        let sent = client.submit_input(ready, clock.now_ms())?;
        handle.submit_input_nowait(sent.input)?;
    }

    let mut rng = DeterministicRng::new(config.simulation.seed);
    let frame_ms = 1_000 / config.render_rate.max(1) as u64;
    let mut render = tokio::time::interval(Duration::from_millis(frame_ms));
    let deadline = tokio::time::Instant::now() + DEMO_DURATION;
    let mut frame_count: u64 = 0;

    while tokio::time::Instant::now() < deadline {
        render.tick().await;
        let now = clock.now_ms();

        loop {
            match frames.try_recv() {
                Ok(frame) => {
                    for client in &mut clients {
                        if let Err(e) = client.receive(&frame, now) {
                            warn!(player = client.player_id(), error = %e, "Frame not applied");
                        }
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Clients fell behind"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if clients.iter().any(|c| c.needs_resync()) {
            handle.request_full_snapshot()?;
        }

        // Roughly one placement per client every second
        if frame_count % config.render_rate.max(1) as u64 == 0 {
            for client in &mut clients {
                let place = InputPayload::PlaceArrow(PlaceArrowPayload {
                    x: rng.next_int(config.simulation.cols) as i32,
                    y: rng.next_int(config.simulation.rows) as i32,
                    direction: rng.choose(&Direction::ALL).copied().unwrap_or(Direction::Up),
                });
                match client.submit_input(place, now) {
                    Ok(sent) => handle.submit_input_nowait(sent.input)?,
                    Err(e) => warn!(player = client.player_id(), error = %e, "Input not predicted"),
                }
            }
        }

        for client in &mut clients {
            client.render(now, frame_ms as f32);
            client.maintain(now);
        }
        frame_count += 1;
    }

    let server_metrics = handle.metrics().await?;
    server.stop().await?;

    info!("=== Demo Complete ===");
    info!(
        ticks = server.core().map_or(0, |c| c.stats().ticks),
        bytes = server_metrics.bytes_sent,
        compression = server_metrics.compression_ratio_avg,
        "Server"
    );
    if let Some(core) = server.core() {
        log_compression(core.compressor());
    }

    for client in &clients {
        let merged = telemetry::combine(&server_metrics, &client.performance_metrics(clock.now_ms()));
        info!(
            player = client.player_id(),
            accuracy = merged.prediction_accuracy,
            rollbacks = merged.rollback_count,
            avg_error = merged.avg_rollback_error,
            dropped = merged.dropped_snapshots,
            "Client"
        );
        let breaches = config.thresholds.report(&merged, &sink);
        if breaches.is_empty() {
            info!(player = client.player_id(), "All metrics within thresholds");
        }
    }
    Ok(())
}

fn log_compression(compressor: &DeltaCompressor) {
    info!(
        deltas = compressor.deltas_emitted(),
        average = compressor.average_ratio(),
        trend = ?compressor.trend(),
        "Delta compression"
    );
}
