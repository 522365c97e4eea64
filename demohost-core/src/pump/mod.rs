//! The frame pump.
//!
//! Lifecycle:
//! - `Uninitialized` until [`FramePump::start`] receives the module load result.
//! - `Failed` if the load failed. Terminal; nothing is ever rendered.
//! - `Running` once every channel's init has either succeeded or excluded it.
//! - `Stopped` after [`FramePump::run`] observes the stop signal or the tick limit.
//!
//! Each tick computes `dt = now - previous`, then for every alive channel in declared
//! order calls render, derives a fresh pixel view and presents it. Nothing runs
//! concurrently and no view outlives the call that produced it.


use wasmtime::{Instance, Store};

use crate::abi::ExportContract;
use crate::channel::{ChannelError, ChannelSpec, DemoChannel};
use crate::clock::{FrameClock, FrameScheduler, StopSignal};
use crate::loader::{LoadError, LoadedModule};
use crate::memory::MemoryBridge;
use crate::surface::Surface;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PumpState {
    Uninitialized,
    Running,
    Failed,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("module load failed: {0}")]
    Load(#[from] LoadError),
    #[error("pump is {0:?}, not running")]
    NotRunning(PumpState),
    #[error("pump was already started")]
    AlreadyStarted,
    #[error("surface for `{name}` is {got_w}x{got_h}, channel wants {want_w}x{want_h}")]
    SurfaceSize {
        name: String,
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("duplicate channel name `{0}`")]
    DuplicateChannel(String),
    #[error("module provides no entrypoints for channel `{0}`")]
    MissingEntrypoints(String),
}

/// A channel spec paired with the surface it presents to.
pub struct ChannelBinding {
    spec: ChannelSpec,
    surface: Box<dyn Surface>,
}

impl ChannelBinding {
    /// Bind `spec` to `surface`. The surface must already have the channel's size.
    pub fn new(spec: ChannelSpec, surface: Box<dyn Surface>) -> Result<Self, PumpError> {
        if surface.width() != spec.width.get() || surface.height() != spec.height.get() {
            return Err(PumpError::SurfaceSize {
                name: spec.name.clone(),
                got_w: surface.width(),
                got_h: surface.height(),
                want_w: spec.width.get(),
                want_h: spec.height.get(),
            });
        }
        Ok(Self { spec, surface })
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }
}

/// Everything that lives exactly as long as the module instance.
pub struct Session {
    pub store: Store<()>,
    pub instance: Instance,
    pub memory: MemoryBridge,
    pub clock: FrameClock,
}

/// Outcome of one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub dt: f64,
    /// Channels presented this tick, in order.
    pub presented: Vec<String>,
    /// Channels excluded during this tick.
    pub excluded: Vec<String>,
}

pub struct FramePump<S: FrameScheduler> {
    state: PumpState,
    bindings: Vec<ChannelBinding>,
    channels: Vec<DemoChannel>,
    session: Option<Session>,
    scheduler: S,
    tick_limit: Option<u64>,
    ticks: u64,
}

impl<S: FrameScheduler> FramePump<S> {
    pub fn new(bindings: Vec<ChannelBinding>, scheduler: S) -> Result<Self, PumpError> {
        let mut seen = std::collections::HashSet::new();
        for binding in &bindings {
            if !seen.insert(binding.spec.name.as_str()) {
                return Err(PumpError::DuplicateChannel(binding.spec.name.clone()));
            }
        }

        Ok(Self {
            state: PumpState::Uninitialized,
            bindings,
            channels: Vec::new(),
            session: None,
            scheduler,
            tick_limit: None,
            ticks: 0,
        })
    }

    /// Stop `run` after this many ticks.
    pub fn with_tick_limit(mut self, limit: Option<u64>) -> Self {
        self.tick_limit = limit;
        self
    }

    /// The exports the module must provide for these channels, in render order.
    pub fn contract(&self) -> ExportContract {
        ExportContract::new(self.bindings.iter().map(|b| b.spec.name.clone()))
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn channels(&self) -> &[DemoChannel] {
        &self.channels
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Take the module load result and initialize every channel.
    ///
    /// A failed load moves the pump to `Failed`. Individual channel init failures only
    /// exclude that channel.
    pub fn start(&mut self, loaded: Result<LoadedModule, LoadError>) -> Result<(), PumpError> {
        if self.state != PumpState::Uninitialized {
            return Err(PumpError::AlreadyStarted);
        }

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, "module load failed; pump will not start");
                self.state = PumpState::Failed;
                return Err(e.into());
            }
        };

        let LoadedModule {
            mut store,
            instance,
            mut memory,
            mut entrypoints,
        } = loaded;

        let mut channels = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings.drain(..) {
            let Some(pos) = entrypoints
                .iter()
                .position(|e| e.demo == binding.spec.name)
            else {
                self.state = PumpState::Failed;
                return Err(PumpError::MissingEntrypoints(binding.spec.name));
            };
            let entry = entrypoints.swap_remove(pos);
            channels.push(DemoChannel::new(binding.spec, entry, binding.surface));
        }

        for channel in &mut channels {
            if let Err(e) = channel.init(&mut store, &mut memory) {
                tracing::error!(error = %e, "failed to initialize channel");
            }
        }

        let alive = channels.iter().filter(|c| c.is_alive()).count();
        tracing::info!(alive, total = channels.len(), "frame pump running");

        let clock = FrameClock::starting_at(self.scheduler.now());
        self.channels = channels;
        self.session = Some(Session {
            store,
            instance,
            memory,
            clock,
        });
        self.state = PumpState::Running;
        Ok(())
    }

    /// Run one tick at timestamp `now` (milliseconds).
    pub fn tick(&mut self, now: f64) -> Result<TickReport, PumpError> {
        if self.state != PumpState::Running {
            return Err(PumpError::NotRunning(self.state));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(PumpError::NotRunning(self.state));
        };

        let dt = session.clock.delta(now);
        let mut report = TickReport {
            dt,
            presented: Vec::new(),
            excluded: Vec::new(),
        };

        for channel in self.channels.iter_mut().filter(|c| c.is_alive()) {
            let result = channel
                .render(&mut session.store, dt)
                .and_then(|()| channel.present(&session.store, &mut session.memory));

            match result {
                Ok(()) => report.presented.push(channel.name().to_string()),
                Err(e @ ChannelError::Present { .. }) => {
                    tracing::warn!(error = %e, "presentation failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "channel dropped out");
                    report.excluded.push(channel.name().to_string());
                }
            }
        }

        session.clock.advance(now);
        self.ticks += 1;
        tracing::trace!(tick = self.ticks, dt, "tick");
        Ok(report)
    }

    /// Pump frames until the stop signal is raised or the tick limit is reached.
    ///
    /// Returns the number of ticks run by this call.
    pub fn run(&mut self, stop: &StopSignal) -> Result<u64, PumpError> {
        if self.state != PumpState::Running {
            return Err(PumpError::NotRunning(self.state));
        }

        let mut ran = 0;
        loop {
            if self.tick_limit.is_some_and(|limit| self.ticks >= limit) {
                tracing::info!(ticks = self.ticks, "tick limit reached");
                break;
            }

            let now = self.scheduler.next_frame();
            if stop.is_raised() {
                tracing::info!(ticks = self.ticks, "stop requested");
                break;
            }

            self.tick(now)?;
            ran += 1;
        }

        self.state = PumpState::Stopped;
        Ok(ran)
    }
}

impl<S: FrameScheduler> std::fmt::Debug for FramePump<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePump")
            .field("state", &self.state)
            .field("channels", &self.channels)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
