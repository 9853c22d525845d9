//! Frame scheduling: one compute step plus one render per refresh.
//!
//! The scheduler owns the step counter and decides which field buffer each tick
//! reads and writes. Backends only see a [`TickPlan`] and must issue its compute
//! and render passes as one ordered submission.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    error::{SchedulerError, TickError},
    sim::{
        FieldBuffer, ParameterStore, PingPong, SimulationParameters, StepCounter, TickPlan,
        pingpong::dispatch_size,
    },
};

/// How often the measured tick rate is logged
const TICK_LOG_INTERVAL_MS: f64 = 2000.0;

/// The execution backend of a [`FrameScheduler`].
pub trait FrameBackend {
    /// Push a parameter record to device-visible memory as one write.
    fn upload_parameters(&mut self, params: &SimulationParameters) -> Result<(), TickError>;

    /// Encode the compute pass and the dependent render pass of `plan` into one
    /// submission and present it. On error nothing of the tick may have been
    /// submitted.
    fn submit(&mut self, plan: &TickPlan) -> Result<(), TickError>;
}

/// Timing of one refresh, as supplied by the presentation source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTiming {
    pub now_ms: f64,
}

impl FrameTiming {
    pub fn now() -> Self {
        Self {
            now_ms: crate::util::now_ms(),
        }
    }
}

/// A source of refresh signals. `None` means the source has ended.
pub trait FrameSource {
    fn next_frame(&mut self) -> impl Future<Output = Option<FrameTiming>>;
}

/// Cooperative stop signal, observed between ticks only.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// A full compute + render pair was submitted
    Submitted,
    /// The backend reported a transient failure; nothing was submitted
    Skipped,
    /// Shutdown was requested before the tick
    Cancelled,
    /// The scheduler stopped after a device loss
    Halted,
}

/// Per-session simulation state: step counter, staged parameters and the
/// precomputed pass table.
pub struct SimulationSession {
    steps: StepCounter,
    params: ParameterStore,
    table: PingPong,
    uploaded: Option<SimulationParameters>,
}

impl SimulationSession {
    /// `uploaded` is the record the backend's parameter buffer was initialized with.
    pub fn new(params: ParameterStore, uploaded: Option<SimulationParameters>) -> Self {
        Self {
            steps: StepCounter::default(),
            params,
            table: PingPong::new(),
            uploaded,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps.get()
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// The buffer holding the most recent state: the last one written, or A
    /// before the first step.
    pub fn current(&self) -> FieldBuffer {
        self.table.pass(self.steps.get()).read
    }

    fn plan(&self, params: &SimulationParameters) -> TickPlan {
        let step = self.steps.get();
        TickPlan {
            step,
            slot: PingPong::slot(step),
            pass: self.table.pass(step),
            dispatch: dispatch_size(params.width as u32, params.height as u32),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub submitted: u64,
    pub skipped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SchedulerState {
    Running,
    Halted,
}

/// Drives a [`FrameBackend`] one tick per refresh.
pub struct FrameScheduler<B> {
    session: SimulationSession,
    backend: B,
    shutdown: ShutdownToken,
    state: SchedulerState,
    stats: TickStats,
    /// Start of the current tick-rate log window
    last_tick_log_time: f64,
    ticks_since_last_log: u32,
}

impl<B: FrameBackend> FrameScheduler<B> {
    pub fn new(session: SimulationSession, backend: B, shutdown: ShutdownToken) -> Self {
        Self {
            session,
            backend,
            shutdown,
            state: SchedulerState::Running,
            stats: TickStats::default(),
            last_tick_log_time: 0.0,
            ticks_since_last_log: 0,
        }
    }

    /// Issue one tick: upload staged parameters if they changed, then submit the
    /// compute pass and the render pass that samples its output.
    ///
    /// Returns `Err` only once, on the tick that first observes a device loss.
    pub fn tick(&mut self, frame: FrameTiming) -> Result<TickOutcome, SchedulerError> {
        if self.state == SchedulerState::Halted {
            return Ok(TickOutcome::Halted);
        }
        if self.shutdown.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }

        let staged = self.session.params.snapshot();
        let result = self.upload_if_changed(&staged).and_then(|()| {
            let plan = self.session.plan(&staged);
            self.backend.submit(&plan)
        });

        match result {
            Ok(()) => {
                self.session.steps.advance();
                self.stats.submitted += 1;
                self.log_tick_rate(frame);
                Ok(TickOutcome::Submitted)
            }
            Err(TickError::Transient(message)) => {
                log::warn!(
                    "skipping tick at step {}: {message}",
                    self.session.steps.get()
                );
                self.stats.skipped += 1;
                Ok(TickOutcome::Skipped)
            }
            Err(TickError::DeviceLost(message)) => {
                log::error!(
                    "device lost at step {}, stopping: {message}",
                    self.session.steps.get()
                );
                self.state = SchedulerState::Halted;
                Err(SchedulerError::DeviceLost(message))
            }
        }
    }

    /// Tick once per frame of `source` until it ends, shutdown is requested, or
    /// the device is lost.
    pub async fn run<S: FrameSource>(&mut self, source: &mut S) -> Result<TickStats, SchedulerError> {
        while !self.shutdown.is_cancelled() {
            let Some(frame) = source.next_frame().await else {
                break;
            };
            match self.tick(frame)? {
                TickOutcome::Submitted | TickOutcome::Skipped => {}
                TickOutcome::Cancelled | TickOutcome::Halted => break,
            }
        }
        log::info!(
            "frame loop finished after {} steps ({} skipped ticks)",
            self.session.steps(),
            self.stats.skipped
        );
        Ok(self.stats)
    }

    fn upload_if_changed(&mut self, staged: &SimulationParameters) -> Result<(), TickError> {
        if self.session.uploaded.as_ref() == Some(staged) {
            return Ok(());
        }
        self.backend.upload_parameters(staged)?;
        log::debug!("uploaded parameters: {staged:?}");
        self.session.uploaded = Some(*staged);
        Ok(())
    }

    fn log_tick_rate(&mut self, frame: FrameTiming) {
        self.ticks_since_last_log += 1;
        if self.last_tick_log_time == 0.0 {
            self.last_tick_log_time = frame.now_ms;
            self.ticks_since_last_log = 0;
        } else if frame.now_ms - self.last_tick_log_time >= TICK_LOG_INTERVAL_MS {
            let elapsed_sec = (frame.now_ms - self.last_tick_log_time) / 1000.0;
            log::info!(
                "Actual tick rate: {:.1} ticks/sec, {} ticks in {:.1}s",
                self.ticks_since_last_log as f64 / elapsed_sec,
                self.ticks_since_last_log,
                elapsed_sec
            );
            self.last_tick_log_time = frame.now_ms;
            self.ticks_since_last_log = 0;
        }
    }

    pub fn session(&self) -> &SimulationSession {
        &self.session
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.state == SchedulerState::Halted
    }
}
