//! demohost - run the demos exported by one WebAssembly module
//!
//! # Usage
//!
//! ```bash
//! # Stock setup: demos.wasm with triangle, dot3d and squish at 800x600
//! demohost
//!
//! # 300 deterministic frames, writing a PNG per demo every 30 frames
//! demohost --module demos.wat --ticks 300 --virtual-time --snapshot-dir shots --snapshot-every 30
//! ```
//!
//! Settings come from `demohost.toml` (or `--config`); flags override the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use demohost_core::{
    ChannelBinding, EnvironmentResolver, FramePump, FrameScheduler, FramebufferSurface,
    HarnessConfig, IntervalScheduler, ModuleLoader, ModuleSource, PngSnapshotSurface,
    SteppedScheduler, StopSignal, Surface, libm_namespace,
};

const DEFAULT_CONFIG: &str = "demohost.toml";

/// Run the pixel demos exported by a WebAssembly module
#[derive(Parser, Debug)]
#[command(name = "demohost")]
#[command(version)]
struct Args {
    /// Config file (default: ./demohost.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Module to load (.wasm or .wat)
    #[arg(long)]
    module: Option<PathBuf>,

    /// Target frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Advance a virtual clock instead of sleeping
    #[arg(long)]
    virtual_time: bool,

    /// Write PNG snapshots of each demo into this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Snapshot every Nth frame
    #[arg(long)]
    snapshot_every: Option<u32>,
}

impl Args {
    fn resolve_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => {
                HarnessConfig::load(Path::new(DEFAULT_CONFIG))?
            }
            None => HarnessConfig::default(),
        };

        if let Some(module) = &self.module {
            config.module = module.clone();
        }
        if let Some(fps) = self.fps {
            config.pump.target_fps = fps;
        }
        if self.ticks.is_some() {
            config.pump.max_ticks = self.ticks;
        }
        if self.virtual_time {
            config.pump.virtual_time = true;
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot.dir = Some(dir.clone());
        }
        if let Some(every) = self.snapshot_every {
            config.snapshot.every = every;
        }

        config.validate()?;
        Ok(config)
    }
}

fn bindings(config: &HarnessConfig) -> Result<Vec<ChannelBinding>> {
    if let Some(dir) = &config.snapshot.dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
    }

    config
        .channel_specs()
        .into_iter()
        .map(|spec| -> Result<ChannelBinding> {
            let (w, h) = (spec.width.get(), spec.height.get());
            let surface: Box<dyn Surface> = match &config.snapshot.dir {
                Some(dir) => Box::new(PngSnapshotSurface::new(
                    dir,
                    &spec.name,
                    w,
                    h,
                    config.snapshot.every,
                )?),
                None => Box::new(FramebufferSurface::new(w, h)?),
            };
            Ok(ChannelBinding::new(spec, surface)?)
        })
        .collect()
}

async fn drive<S>(config: HarnessConfig, scheduler: S, stop: StopSignal) -> Result<()>
where
    S: FrameScheduler + 'static,
{
    let mut pump = FramePump::new(bindings(&config)?, scheduler)?
        .with_tick_limit(config.pump.max_ticks);

    let resolver = EnvironmentResolver::new([libm_namespace()]);
    let unresolved = resolver.unresolved_calls().clone();
    let loader = ModuleLoader::new(resolver)?;

    tracing::info!(module = %config.module.display(), "loading module");
    let loaded = loader
        .load(ModuleSource::File(config.module.clone()), &pump.contract())
        .await;
    pump.start(loaded)
        .with_context(|| format!("failed to start demos from {}", config.module.display()))?;

    let (pump, ran) = tokio::task::spawn_blocking(move || {
        let ran = pump.run(&stop);
        (pump, ran)
    })
    .await
    .context("frame pump thread panicked")?;
    let ran = ran?;

    let excluded: Vec<&str> = pump
        .channels()
        .iter()
        .filter(|c| !c.is_alive())
        .map(|c| c.name())
        .collect();
    tracing::info!(ticks = ran, ?excluded, "frame pump stopped");
    for (import, calls) in unresolved.counts() {
        tracing::warn!(import, calls, "guest called an unimplemented import");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;

    let stop = StopSignal::new();
    let on_interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after this frame");
            on_interrupt.raise();
        }
    });

    let fps = config.pump.target_fps;
    if config.pump.virtual_time {
        drive(config, SteppedScheduler::at_fps(fps), stop).await
    } else {
        drive(config, IntervalScheduler::new(fps), stop).await
    }
}
