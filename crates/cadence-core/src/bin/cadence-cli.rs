use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use cadence_core::{
    LoopConfig, OfflineSession, PlayerConfig, Timeline,
    assets::{peak, write_wav},
    diagnostics::init_tracing,
    fixtures::demo_document,
    persistence::{load_project, save_document},
};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cadence-cli")]
#[command(about = "Headless rendering through the cadence playback scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; defaults to CADENCE_CONFIG_PATH or cadence.config.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule playback of a project offline and write what the output heard.
    Render {
        /// Project document; the built-in demo when omitted.
        #[arg(long)]
        project: Option<PathBuf>,

        #[arg(long, default_value_t = 1.0)]
        start: f64,

        #[arg(long)]
        end: Option<f64>,

        #[arg(long, requires = "loop_end")]
        loop_start: Option<f64>,

        #[arg(long, requires = "loop_start")]
        loop_end: Option<f64>,

        /// Loop the whole project.
        #[arg(long, conflicts_with = "loop_start")]
        loop_project: bool,

        /// Seconds to render; defaults to the window (two passes when looping) plus a second.
        #[arg(long)]
        seconds: Option<f64>,

        #[arg(long)]
        volume_db: Option<f64>,

        #[arg(long, default_value = "data/renders/render.wav")]
        output: PathBuf,
    },
    /// Write the demo project document.
    Demo {
        #[arg(long, default_value = "data/demo/demo.cadence.json")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PlayerConfig::load_from(path)?,
        None => PlayerConfig::load_or_default()?,
    };
    if let Some(log_dir) = cli.log_dir {
        config.diagnostics.log_dir = log_dir;
    }
    let _telemetry = init_tracing(&config.diagnostics)?;

    match cli.command {
        Commands::Render {
            project,
            start,
            end,
            loop_start,
            loop_end,
            loop_project,
            seconds,
            volume_db,
            output,
        } => {
            let sample_rate = config.audio.sample_rate;
            let loaded = match &project {
                Some(path) => load_project(path, sample_rate)?,
                None => demo_document().resolve(&PathBuf::from("."), sample_rate)?,
            };

            let mut session = OfflineSession::from_config(&config)?;
            let scheduler = session.scheduler_mut();
            scheduler.set_rendering_data(Arc::new(loaded.project), loaded.muted, loaded.bypassed)?;
            let loop_config = match (loop_start, loop_end) {
                (Some(loop_start), Some(loop_end)) => LoopConfig::selection(loop_start, loop_end),
                _ if loop_project => LoopConfig::whole_project(),
                _ => LoopConfig::off(),
            };
            scheduler.set_loop(loop_config)?;
            if let Some(volume_db) = volume_db {
                scheduler.set_volume(volume_db)?;
            }

            let seconds = match seconds {
                Some(seconds) => seconds,
                None => default_render_seconds(scheduler, start, end, loop_config)?,
            };
            scheduler.play(start, end, 0.0)?;
            let samples = session.run_for(seconds)?;

            let channels = u16::try_from(session.context().channels())
                .context("channel count does not fit a wav header")?;
            write_wav(&output, &samples, sample_rate, channels)?;
            info!(
                path = %output.display(),
                seconds,
                peak = peak(&samples),
                started = session.started_count(),
                finished = session.finished_count(),
                "render written"
            );
        }
        Commands::Demo { output } => {
            save_document(&output, &demo_document())?;
            info!(path = %output.display(), "demo project written");
        }
    }

    Ok(())
}

fn default_render_seconds(
    scheduler: &cadence_core::driver::OfflineScheduler,
    start: f64,
    end: Option<f64>,
    loop_config: LoopConfig,
) -> anyhow::Result<f64> {
    let timeline = scheduler.timeline().context("no project loaded")?;
    let project_end = scheduler
        .project()
        .map(|project| project.end_measure())
        .context("no project loaded")?;
    let (from, to, passes) = if loop_config.is_selection() {
        (loop_config.start, loop_config.end, 2.0)
    } else if loop_config.on {
        (1.0, project_end, 2.0)
    } else {
        (start, end.unwrap_or(project_end), 1.0)
    };
    let window = timeline.measure_to_time(to) - timeline.measure_to_time(from);
    Ok(window.max(0.0) * passes + 1.0)
}
