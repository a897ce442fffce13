pub mod animation;
pub mod config;
pub mod data;
pub mod error;
pub mod lint;
pub mod logging;
pub mod pipeline;
pub mod processing;
pub mod projection;
pub mod render;
pub mod scene;
pub mod server;
pub mod session;
pub mod transform;
pub mod types;
pub mod watch;
pub mod years;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::animation::{Animator, Clock};
use crate::config::AppConfig;
use crate::pipeline::{Pipeline, Task};
use crate::processing::RadiusScale;
use crate::projection::Mercator;
use crate::scene::RenderState;
use crate::types::{Region, YearAggregate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More output (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one map frame per year into the frame directory
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Build the static site into the output directory
    Build {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Task to run (its prerequisites run first)
        #[arg(short, long, value_enum, default_value_t = Task::Default)]
        task: Task,
    },
    /// Remove the output directory
    Clean {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Check data and markup for consistency problems
    Lint {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Build, watch for changes and serve with live reload and the live map
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

/// Everything derived from the input datasets.
struct Model {
    regions: Vec<Region>,
    aggregates: Arc<BTreeMap<i32, YearAggregate>>,
    sequence: Vec<i32>,
    missing: Vec<i32>,
    projection: Mercator,
    radius: RadiusScale,
}

impl Model {
    fn load(config: &AppConfig) -> anyhow::Result<Self> {
        let seq = &config.sequence;
        let sequence = years::year_sequence(seq.start, seq.end, seq.step, &seq.exclude)?;

        let events = data::load_events(&config.input.events)?;
        let regions = data::load_boundaries(&config.input.boundaries, &config.input.region_name_property)?;

        let projection = Mercator::for_map(&config.map);
        let aggregates = processing::aggregate_years(&events, &projection);
        let missing = processing::reconcile(&sequence, &aggregates);
        let radius = RadiusScale::for_aggregates(aggregates.values(), config.map.max_radius);

        Ok(Self {
            regions,
            aggregates: Arc::new(aggregates),
            sequence,
            missing,
            projection,
            radius,
        })
    }

    fn animator<C: Clock>(&self, config: &AppConfig, clock: C) -> anyhow::Result<Animator<C>> {
        let scene = RenderState::new(config.map.clone(), &self.projection, &self.regions, self.radius);
        let animator = Animator::new(
            self.sequence.clone(),
            self.aggregates.clone(),
            scene,
            clock,
            Duration::from_millis(config.animation.interval_ms),
        )?;
        Ok(animator)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(logging::Verbosity::from_flags(cli.quiet, cli.verbose));

    match &cli.command {
        Commands::Render { config } => {
            info!("rendering frames with config {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let model = Model::load(&app_config)?;

            let clock = animation::VirtualClock::new();
            let mut animator = model.animator(&app_config, clock.clone())?;
            let playback = render::collect_frames(&mut animator, &clock)?;
            render::write_frames(
                &app_config.output.frame_dir,
                &playback,
                &model.aggregates,
                &model.missing,
                app_config.output.png,
            )?;
            info!("rendering complete");
        }
        Commands::Build { config, task } => {
            let app_config = AppConfig::load_from_file(config)?;
            let report = Pipeline::new(app_config.build).run(*task)?;
            if !report.is_success() {
                for failure in &report.failures {
                    error!("{failure}");
                }
                return Err(anyhow!("build finished with {} failure(s)", report.failures.len()));
            }
        }
        Commands::Clean { config } => {
            let app_config = AppConfig::load_from_file(config)?;
            Pipeline::new(app_config.build).run(Task::Clean)?;
        }
        Commands::Lint { config } => {
            let app_config = AppConfig::load_from_file(config)?;
            let model = Model::load(&app_config)?;
            let mut findings = lint::lint_data(&model.sequence, &model.aggregates, &model.regions);
            let pipeline = Pipeline::new(app_config.build.clone());
            findings.extend(lint::lint_markup(&pipeline)?);
            findings.extend(lint::lint_scripts(&pipeline)?);
            for finding in &findings {
                warn!("{finding}");
            }
            if !findings.is_empty() {
                return Err(anyhow!("lint found {} problem(s)", findings.len()));
            }
            info!("no problems found");
        }
        Commands::Serve { config } => {
            info!("serving with config {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let pipeline = Arc::new(Pipeline::new(app_config.build.clone()));

            // A broken source file should not keep the server from starting.
            let report = pipeline.run(Task::Default)?;
            if !report.is_success() {
                warn!(failures = report.failures.len(), "initial build had failures");
            }

            let model = Model::load(&app_config).context("Failed to load map data")?;
            let session = session::Session::new(model.animator(&app_config, animation::SystemClock::new())?);

            let (reload_tx, _) = tokio::sync::broadcast::channel(16);
            let rebuilder = watch::Rebuilder::new(pipeline, reload_tx.clone());
            tokio::spawn(watch::watch(
                rebuilder,
                Duration::from_millis(app_config.server.watch_interval_ms),
            ));

            let resolution = Duration::from_millis((app_config.animation.interval_ms / 10).max(10));
            let driver = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session::drive(driver, resolution).await {
                    error!("animation stopped: {e}");
                }
            });

            let state = Arc::new(server::AppState::new(
                model.regions,
                model.aggregates,
                model.missing,
                session,
                reload_tx,
            ));
            server::start_server(state, app_config.build.dist_dir.clone(), app_config.server.port).await?;
        }
    }

    Ok(())
}
