//! Authoritative Server
//!
//! Fixed-rate tick loop owning the only mutable copy of the simulation.
//! [`ServerCore`] is the synchronous tick machine; [`AuthoritativeServer`]
//! drives it from a tokio task, taking commands over an mpsc channel and
//! broadcasting encoded frames.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::buffer::{mean, RollingHistory};
use crate::core::time::{Clock, SystemClock};
use crate::error::SimulationFault;
use crate::game::events::{NetcodeEvent, SharedSink};
use crate::game::input::PredictiveInput;
use crate::game::simulation::Simulation;
use crate::game::state::{PlayerId, PlayerState, Sequence, Snapshot};
use crate::network::delta::{DeltaCompressor, DeltaConfig};
use crate::network::protocol::{Envelope, InputAcknowledgment, Payload, PerformanceMetrics};
use crate::network::session::{InputIntake, IntakeConfig, SessionError};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Starting tick rate (Hz).
    pub tick_rate: u32,
    /// Lowest rate `adjust_tick_rate` may pick.
    pub min_tick_rate: u32,
    /// Highest rate `adjust_tick_rate` may pick.
    pub max_tick_rate: u32,
    /// Ticks between full snapshots.
    pub full_snapshot_interval: u64,
    /// Ticks between metrics frames. 0 disables them.
    pub metrics_interval_ticks: u64,
    /// Snapshots kept in the server history.
    pub history_len: usize,
    /// Consecutive faults before an escalation event.
    pub fault_escalation_threshold: u32,
    /// Player count treated as full load.
    pub reference_players: u32,
    /// Entity count treated as full load.
    pub reference_entities: u32,
    /// Outbound broadcast channel capacity.
    pub broadcast_capacity: usize,
    /// Maximum players admitted.
    pub max_players: usize,
    /// Maximum inputs queued between ticks.
    pub max_queued_inputs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            min_tick_rate: 10,
            max_tick_rate: 30,
            full_snapshot_interval: 20,
            metrics_interval_ticks: 100,
            history_len: 64,
            fault_escalation_threshold: 5,
            reference_players: 8,
            reference_entities: 200,
            broadcast_capacity: 256,
            max_players: 16,
            max_queued_inputs: 256,
        }
    }
}

impl ServerConfig {
    fn intake(&self) -> IntakeConfig {
        IntakeConfig {
            max_players: self.max_players,
            max_queued_inputs: self.max_queued_inputs,
        }
    }
}

/// Server errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    /// Server was stopped and cannot be restarted.
    #[error("Server already stopped")]
    AlreadyStopped,

    /// Tick loop is not running.
    #[error("Server not running")]
    NotRunning,

    /// Command channel closed.
    #[error("Server command channel closed")]
    ChannelClosed,

    /// Player admission failed.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Constructed, not ticking.
    Init,
    /// Tick loop running.
    Running,
    /// Shut down for good.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Init => "init",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Snapshot produced; frames ready to broadcast.
    Emitted {
        /// Sequence of the new snapshot
        sequence: Sequence,
        /// Snapshot or delta frame, then any metrics frame
        frames: Vec<Bytes>,
        /// Whether a full snapshot was sent
        full: bool,
    },
    /// Simulation failed; nothing emitted.
    Skipped(SimulationFault),
}

impl TickOutcome {
    /// Frames to broadcast, empty for a skipped tick.
    pub fn frames(&self) -> &[Bytes] {
        match self {
            TickOutcome::Emitted { frames, .. } => frames,
            TickOutcome::Skipped(_) => &[],
        }
    }
}

/// Running counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Ticks that produced a snapshot.
    pub ticks: u64,
    /// Ticks skipped by a fault.
    pub faults: u64,
    /// Inputs dropped with skipped ticks.
    pub dropped_inputs: u64,
    /// Frames produced.
    pub frames_sent: u64,
    /// Bytes produced.
    pub bytes_sent: u64,
    /// Full snapshots produced.
    pub full_snapshots: u64,
}

// =============================================================================
// CORE
// =============================================================================

/// Synchronous tick machine.
pub struct ServerCore<S: Simulation> {
    config: ServerConfig,
    simulation: S,
    intake: InputIntake,
    current: Snapshot,
    history: RollingHistory<Snapshot>,
    keyframe: Option<Snapshot>,
    compressor: DeltaCompressor,
    clock: Arc<dyn Clock>,
    sink: SharedSink,
    tick_rate: u32,
    ticks_since_full: u64,
    force_full: bool,
    consecutive_faults: u32,
    tick_times: RollingHistory<f32>,
    stats: ServerStats,
}

impl<S: Simulation> ServerCore<S> {
    /// Create a core starting from `initial`.
    pub fn new(config: ServerConfig, delta: DeltaConfig, simulation: S, initial: Snapshot, sink: SharedSink) -> Self {
        let tick_rate = config.tick_rate.clamp(config.min_tick_rate, config.max_tick_rate);
        Self {
            intake: InputIntake::new(config.intake(), sink.clone()),
            history: RollingHistory::new(config.history_len),
            compressor: DeltaCompressor::new(delta),
            clock: Arc::new(SystemClock),
            tick_times: RollingHistory::new(100),
            current: initial,
            keyframe: None,
            ticks_since_full: 0,
            force_full: true,
            consecutive_faults: 0,
            stats: ServerStats::default(),
            tick_rate,
            simulation,
            config,
            sink,
        }
    }

    /// Replace the timestamp source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admit a player into the intake and the board.
    pub fn add_player(&mut self, player_id: PlayerId, name: &str) -> Result<(), SessionError> {
        self.intake.add_player(player_id)?;
        self.current.players.push(PlayerState::new(player_id, name));
        self.current.normalize();
        info!(player_id, name, "Player joined");
        Ok(())
    }

    /// Validate and queue an input.
    pub fn submit_input(&mut self, input: PredictiveInput) -> InputAcknowledgment {
        let now = self.clock.now_ms();
        self.intake.submit(input, &self.current, now)
    }

    /// Encode an acknowledgment frame.
    pub fn ack_frame(&mut self, ack: InputAcknowledgment) -> Bytes {
        self.frame(ack.timestamp, Payload::Ack(ack))
    }

    /// Send a full snapshot on the next tick.
    pub fn request_full_snapshot(&mut self) {
        self.force_full = true;
    }

    /// Run one tick.
    pub fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();
        let inputs = self.intake.drain();
        let sequence = self.current.sequence + 1;

        let mut next = match self.step(&inputs) {
            Ok(next) => next,
            Err(fault) => return self.skip_tick(sequence, inputs.len(), fault),
        };
        self.consecutive_faults = 0;

        next.sequence = sequence;
        next.timestamp = self.clock.now_ms();
        next.normalize();

        let full = self.force_full
            || self.keyframe.is_none()
            || self.ticks_since_full + 1 >= self.config.full_snapshot_interval;

        let payload = match (&self.keyframe, full) {
            (Some(keyframe), false) => {
                self.ticks_since_full += 1;
                Payload::Delta(self.compressor.compress(keyframe, &next))
            }
            _ => {
                self.ticks_since_full = 0;
                self.force_full = false;
                self.keyframe = Some(next.clone());
                self.stats.full_snapshots += 1;
                Payload::Snapshot(next.clone())
            }
        };

        let mut frames = vec![self.frame(next.timestamp, payload)];
        let bytes = frames[0].len();

        self.current = next.clone();
        self.history.push(next);
        self.stats.ticks += 1;

        let tick_ms = started.elapsed().as_secs_f32() * 1000.0;
        self.tick_times.push(tick_ms);

        if self.config.metrics_interval_ticks > 0 && self.stats.ticks % self.config.metrics_interval_ticks == 0 {
            let metrics = self.performance_metrics();
            frames.push(self.frame(metrics.timestamp, Payload::Metrics(metrics)));
        }

        #[cfg(feature = "debug-tracing")]
        debug!(sequence, inputs = inputs.len(), full, bytes, tick_ms, "Tick complete");

        self.sink.emit(NetcodeEvent::TickCompleted {
            sequence,
            inputs: inputs.len(),
            full,
            bytes,
            tick_ms,
        });

        TickOutcome::Emitted { sequence, frames, full }
    }

    fn step(&mut self, inputs: &[PredictiveInput]) -> Result<Snapshot, SimulationFault> {
        let simulation = &mut self.simulation;
        let current = &self.current;
        match panic::catch_unwind(AssertUnwindSafe(|| simulation.step(current, inputs))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(SimulationFault::Panicked(message))
            }
        }
    }

    fn skip_tick(&mut self, sequence: Sequence, dropped: usize, fault: SimulationFault) -> TickOutcome {
        self.consecutive_faults += 1;
        self.stats.faults += 1;
        self.stats.dropped_inputs += dropped as u64;
        error!(sequence, consecutive = self.consecutive_faults, %fault, "Tick skipped");

        self.sink.emit(NetcodeEvent::SimulationFault {
            sequence,
            consecutive: self.consecutive_faults,
            message: fault.to_string(),
        });
        if self.consecutive_faults == self.config.fault_escalation_threshold {
            self.sink.emit(NetcodeEvent::FaultEscalation {
                consecutive: self.consecutive_faults,
            });
        }
        TickOutcome::Skipped(fault)
    }

    fn frame(&mut self, timestamp: u64, payload: Payload) -> Bytes {
        self.stats.frames_sent += 1;
        let bytes = Envelope::new(self.stats.frames_sent, timestamp, payload).to_bytes();
        self.stats.bytes_sent += bytes.len() as u64;
        bytes
    }

    /// Pick a tick rate from load. Returns the rate now in effect.
    pub fn adjust_tick_rate(&mut self, players: u32, entities: u32) -> u32 {
        let load_of = |n: u32, reference: u32| if reference == 0 { 1.0 } else { n as f32 / reference as f32 };
        let load = load_of(players, self.config.reference_players)
            .max(load_of(entities, self.config.reference_entities))
            .clamp(0.0, 1.0);

        let (min, max) = (self.config.min_tick_rate, self.config.max_tick_rate);
        let target = (max as f32 - (max - min) as f32 * load).round() as u32;
        let target = target.clamp(min, max);

        if target != self.tick_rate {
            self.sink.emit(NetcodeEvent::TickRateAdjusted {
                old_rate: self.tick_rate as f32,
                new_rate: target as f32,
                players: players as usize,
                entities: entities as usize,
            });
            self.tick_rate = target;
        }
        self.tick_rate
    }

    /// Server-side telemetry.
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            timestamp: self.clock.now_ms(),
            tick_rate: self.tick_rate as f32,
            avg_tick_ms: mean(self.tick_times.iter()).unwrap_or(0.0),
            player_count: self.current.players.len() as u32,
            entity_count: self.current.entity_count() as u32,
            bytes_sent: self.stats.bytes_sent,
            compression_ratio_avg: self.compressor.average_ratio(),
            snapshot_buffer_len: self.history.len() as u32,
            simulation_faults: self.stats.faults,
            ..Default::default()
        }
    }

    /// Current tick rate (Hz).
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Latest authoritative snapshot.
    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    /// Historic snapshot by sequence.
    pub fn snapshot_at(&self, sequence: Sequence) -> Option<&Snapshot> {
        self.history.iter().find(|s| s.sequence == sequence)
    }

    /// Counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Delta compressor state.
    pub fn compressor(&self) -> &DeltaCompressor {
        &self.compressor
    }

    /// Consecutive faulted ticks.
    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }
}

// =============================================================================
// ASYNC HOST
// =============================================================================

/// Commands accepted by the tick loop.
#[derive(Debug)]
pub enum ServerCommand {
    /// Validate and queue an input.
    SubmitInput {
        /// Input to queue
        input: PredictiveInput,
        /// Receives the acknowledgment
        reply: Option<oneshot::Sender<InputAcknowledgment>>,
    },
    /// Admit a player.
    AddPlayer {
        /// Player id
        player_id: PlayerId,
        /// Display name
        name: String,
        /// Receives the admission result
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    /// Retune the tick rate from load.
    AdjustTickRate {
        /// Players connected
        players: u32,
        /// Entities alive
        entities: u32,
    },
    /// Force a full snapshot on the next tick.
    RequestFull,
    /// Report server telemetry.
    Metrics {
        /// Receives the metrics
        reply: oneshot::Sender<PerformanceMetrics>,
    },
    /// Stop the loop.
    Shutdown,
}

/// Cloneable command sender for a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerHandle {
    fn send(&self, command: ServerCommand) -> Result<(), ServerError> {
        self.commands.send(command).map_err(|_| ServerError::ChannelClosed)
    }

    /// Submit an input and wait for its acknowledgment.
    pub async fn submit_input(&self, input: PredictiveInput) -> Result<InputAcknowledgment, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::SubmitInput { input, reply: Some(reply) })?;
        rx.await.map_err(|_| ServerError::ChannelClosed)
    }

    /// Submit an input without waiting. The ack is still broadcast.
    pub fn submit_input_nowait(&self, input: PredictiveInput) -> Result<(), ServerError> {
        self.send(ServerCommand::SubmitInput { input, reply: None })
    }

    /// Admit a player.
    pub async fn add_player(&self, player_id: PlayerId, name: impl Into<String>) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::AddPlayer { player_id, name: name.into(), reply })?;
        rx.await.map_err(|_| ServerError::ChannelClosed)?
    }

    /// Retune the tick rate from load.
    pub fn adjust_tick_rate(&self, players: u32, entities: u32) -> Result<(), ServerError> {
        self.send(ServerCommand::AdjustTickRate { players, entities })
    }

    /// Ask for a full snapshot on the next tick.
    pub fn request_full_snapshot(&self) -> Result<(), ServerError> {
        self.send(ServerCommand::RequestFull)
    }

    /// Fetch server telemetry.
    pub async fn metrics(&self) -> Result<PerformanceMetrics, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Metrics { reply })?;
        rx.await.map_err(|_| ServerError::ChannelClosed)
    }

    /// Ask the loop to stop.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        self.send(ServerCommand::Shutdown)
    }
}

/// Tokio host for a [`ServerCore`].
pub struct AuthoritativeServer<S: Simulation + 'static> {
    core: Option<ServerCore<S>>,
    commands_tx: mpsc::UnboundedSender<ServerCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ServerCommand>>,
    outbound: broadcast::Sender<Bytes>,
    state_tx: watch::Sender<ServerState>,
    task: Option<JoinHandle<ServerCore<S>>>,
    sink: SharedSink,
}

impl<S: Simulation + 'static> AuthoritativeServer<S> {
    /// Create a server in the `Init` state.
    pub fn new(core: ServerCore<S>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(core.config.broadcast_capacity.max(1));
        let (state_tx, _) = watch::channel(ServerState::Init);
        let sink = core.sink.clone();
        Self {
            core: Some(core),
            commands_tx,
            commands_rx: Some(commands_rx),
            outbound,
            state_tx,
            task: None,
            sink,
        }
    }

    /// Command sender.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Receiver of outbound frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.outbound.subscribe()
    }

    /// Watch lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    fn transition(&self, to: ServerState) {
        let from = self.state();
        if from != to {
            self.state_tx.send_replace(to);
            info!(%from, %to, "Server state changed");
            self.sink.emit(NetcodeEvent::ServerStateChanged {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    /// Spawn the tick loop.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<(), ServerError> {
        match self.state() {
            ServerState::Running => {
                warn!("Server already running");
                return Ok(());
            }
            ServerState::Stopped => return Err(ServerError::AlreadyStopped),
            ServerState::Init => {}
        }

        let (core, commands) = match (self.core.take(), self.commands_rx.take()) {
            (Some(core), Some(commands)) => (core, commands),
            _ => return Err(ServerError::AlreadyStopped),
        };

        info!(tick_rate = core.tick_rate(), "Starting tick loop");
        self.task = Some(tokio::spawn(run_loop(core, commands, self.outbound.clone())));
        self.transition(ServerState::Running);
        Ok(())
    }

    /// Stop the tick loop and wait for it to finish.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if self.state() == ServerState::Stopped {
            return Ok(());
        }
        let _ = self.commands_tx.send(ServerCommand::Shutdown);
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(core) => self.core = Some(core),
                Err(e) => error!("Tick loop ended abnormally: {}", e),
            }
        }
        self.transition(ServerState::Stopped);
        Ok(())
    }

    /// Core of a stopped or unstarted server.
    pub fn core(&self) -> Option<&ServerCore<S>> {
        self.core.as_ref()
    }
}

fn tick_period(rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / rate.max(1) as u64)
}

fn ticker(rate: u32, immediate: bool) -> Interval {
    let period = tick_period(rate);
    let mut ticker = if immediate {
        interval(period)
    } else {
        interval_at(tokio::time::Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_loop<S: Simulation>(
    mut core: ServerCore<S>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    outbound: broadcast::Sender<Bytes>,
) -> ServerCore<S> {
    let mut tick_interval = ticker(core.tick_rate(), true);

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                for frame in core.tick().frames() {
                    // No subscribers is fine
                    let _ = outbound.send(frame.clone());
                }
            }
            command = commands.recv() => match command {
                None | Some(ServerCommand::Shutdown) => break,
                Some(ServerCommand::SubmitInput { input, reply }) => {
                    let ack = core.submit_input(input);
                    let frame = core.ack_frame(ack.clone());
                    let _ = outbound.send(frame);
                    if let Some(reply) = reply {
                        let _ = reply.send(ack);
                    }
                }
                Some(ServerCommand::AddPlayer { player_id, name, reply }) => {
                    let _ = reply.send(core.add_player(player_id, &name).map_err(ServerError::from));
                }
                Some(ServerCommand::AdjustTickRate { players, entities }) => {
                    let old = core.tick_rate();
                    let new = core.adjust_tick_rate(players, entities);
                    if new != old {
                        debug!(old, new, "Tick interval rebuilt");
                        tick_interval = ticker(new, false);
                    }
                }
                Some(ServerCommand::RequestFull) => core.request_full_snapshot(),
                Some(ServerCommand::Metrics { reply }) => {
                    let _ = reply.send(core.performance_metrics());
                }
            }
        }
    }

    info!(ticks = core.stats().ticks, "Tick loop stopped");
    core
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::game::events::{EventLog, NullSink};
    use crate::game::simulation::{GridConfig, GridSimulation};
    use crate::game::state::Direction;
    use crate::network::delta::apply_delta;

    fn grid_core(config: ServerConfig, sink: SharedSink) -> ServerCore<GridSimulation> {
        let sim = GridSimulation::new(GridConfig::default());
        let initial = sim.initial_snapshot();
        ServerCore::new(config, DeltaConfig::default(), sim, initial, sink)
            .with_clock(Arc::new(ManualClock::new(1_000)))
    }

    fn decode(frame: &Bytes) -> Envelope {
        Envelope::from_bytes(frame).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, 20);
        assert_eq!((config.min_tick_rate, config.max_tick_rate), (10, 30));
    }

    #[test]
    fn test_first_tick_is_full_then_deltas() {
        let mut core = grid_core(ServerConfig::default(), Arc::new(NullSink));
        core.add_player(1, "ada").unwrap();

        let first = core.tick();
        let TickOutcome::Emitted { sequence, frames, full } = first else {
            panic!("tick skipped");
        };
        assert_eq!(sequence, 1);
        assert!(full);
        let keyframe = match decode(&frames[0]).payload {
            Payload::Snapshot(s) => s,
            other => panic!("expected snapshot, got {:?}", other.message_type()),
        };
        assert_eq!(keyframe.sequence, 1);
        assert_eq!(keyframe.timestamp, 1_000);

        let ack = core.submit_input(PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up));
        assert!(ack.accepted);

        let TickOutcome::Emitted { frames, full, .. } = core.tick() else {
            panic!("tick skipped");
        };
        assert!(!full);
        let delta = match decode(&frames[0]).payload {
            Payload::Delta(d) => d,
            other => panic!("expected delta, got {:?}", other.message_type()),
        };
        assert_eq!(delta.base_sequence, 1);
        assert_eq!(delta.delta_sequence, 2);
        assert_eq!(delta.new_arrows.len(), 1);

        let rebuilt = apply_delta(&keyframe, &delta).unwrap();
        assert_eq!(rebuilt.arrows, core.current().arrows);
        assert_eq!(rebuilt.sequence, 2);
    }

    #[test]
    fn test_full_snapshot_interval_and_request() {
        let config = ServerConfig {
            full_snapshot_interval: 3,
            metrics_interval_ticks: 0,
            ..Default::default()
        };
        let mut core = grid_core(config, Arc::new(NullSink));
        let fulls: Vec<bool> = (0..7)
            .map(|_| matches!(core.tick(), TickOutcome::Emitted { full: true, .. }))
            .collect();
        assert_eq!(fulls, vec![true, false, false, true, false, false, true]);

        core.request_full_snapshot();
        assert!(matches!(core.tick(), TickOutcome::Emitted { full: true, .. }));
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let mut core = grid_core(ServerConfig::default(), Arc::new(NullSink));
        let mut last = 0;
        for _ in 0..30 {
            if let TickOutcome::Emitted { sequence, .. } = core.tick() {
                assert!(sequence > last);
                last = sequence;
            }
        }
        assert!(core.snapshot_at(last).is_some());
    }

    #[test]
    fn test_metrics_frame() {
        let config = ServerConfig {
            metrics_interval_ticks: 2,
            ..Default::default()
        };
        let mut core = grid_core(config, Arc::new(NullSink));
        assert_eq!(core.tick().frames().len(), 1);
        let frames = core.tick().frames().to_vec();
        assert_eq!(frames.len(), 2);
        match decode(&frames[1]).payload {
            Payload::Metrics(m) => assert_eq!(m.tick_rate, 20.0),
            other => panic!("expected metrics, got {:?}", other.message_type()),
        }
    }

    #[test]
    fn test_fault_skips_tick_and_escalates() {
        let log = EventLog::new();
        let config = ServerConfig {
            fault_escalation_threshold: 2,
            ..Default::default()
        };
        let mut calls = 0;
        let sim = move |prev: &Snapshot, _inputs: &[PredictiveInput]| -> Result<Snapshot, SimulationFault> {
            calls += 1;
            match calls {
                2 => Err(SimulationFault::Failed("boom".into())),
                3 => panic!("simulation exploded"),
                _ => Ok(prev.clone()),
            }
        };
        let mut core = ServerCore::new(config, DeltaConfig::default(), sim, Snapshot::new(4, 4), Arc::new(log.clone()));
        core.add_player(1, "ada").unwrap();

        assert!(matches!(core.tick(), TickOutcome::Emitted { sequence: 1, .. }));

        core.submit_input(PredictiveInput::action(1, 1, 0, 3));
        assert!(matches!(core.tick(), TickOutcome::Skipped(SimulationFault::Failed(_))));
        assert!(matches!(core.tick(), TickOutcome::Skipped(SimulationFault::Panicked(m)) if m.contains("exploded")));
        assert_eq!(core.consecutive_faults(), 2);
        assert_eq!(core.stats().dropped_inputs, 1);
        assert_eq!(log.count("simulation_fault"), 2);
        assert_eq!(log.count("fault_escalation"), 1);

        // Skipped ticks do not consume sequences
        assert!(matches!(core.tick(), TickOutcome::Emitted { sequence: 2, .. }));
        assert_eq!(core.consecutive_faults(), 0);
    }

    #[test]
    fn test_adjust_tick_rate() {
        let log = EventLog::new();
        let mut core = grid_core(ServerConfig::default(), Arc::new(log.clone()));
        assert_eq!(core.adjust_tick_rate(0, 0), 30);
        assert_eq!(core.adjust_tick_rate(8, 0), 10);
        assert_eq!(core.adjust_tick_rate(4, 0), 20);
        assert_eq!(core.adjust_tick_rate(100, 10_000), 10);
        assert_eq!(log.count("tick_rate_adjusted"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_lifecycle() {
        let log = EventLog::new();
        let mut server = AuthoritativeServer::new(grid_core(ServerConfig::default(), Arc::new(log.clone())));
        assert_eq!(server.state(), ServerState::Init);

        let mut frames = server.subscribe();
        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Running);
        // Second start is a no-op
        server.start().unwrap();

        let handle = server.handle();
        handle.add_player(1, "ada").await.unwrap();
        assert!(matches!(
            handle.add_player(1, "ada").await,
            Err(ServerError::Session(SessionError::AlreadyInSession(1)))
        ));

        let first = decode(&frames.recv().await.unwrap());
        assert!(matches!(first.payload, Payload::Snapshot(_)));

        let ack = handle
            .submit_input(PredictiveInput::place_arrow(1, 1, 0, 12, 8, Direction::Up))
            .await
            .unwrap();
        assert!(ack.accepted);

        let mut saw_ack = false;
        let mut saw_delta = false;
        while !(saw_ack && saw_delta) {
            match decode(&frames.recv().await.unwrap()).payload {
                Payload::Ack(a) => saw_ack = a.accepted,
                Payload::Delta(d) => saw_delta = !d.new_arrows.is_empty() || saw_delta,
                _ => {}
            }
        }

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.player_count, 1);

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.core().is_some_and(|c| c.stats().ticks >= 2));
        assert_eq!(server.start(), Err(ServerError::AlreadyStopped));
        assert_eq!(log.count("server_state_changed"), 2);
    }
}
