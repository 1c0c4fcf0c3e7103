use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use stac_tiles::search::BoundingBox;
use stac_tiles::server::{self, AppState};
use stac_tiles::{calculate_max_zoom, PlanetaryPipeline, Settings, StageProgress};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Fetch STAC rasters, tile them and serve the tiles")]
struct Cli {
    /// Settings file. The built-in Planetary Computer template is used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve tiles and admin endpoints for every configured provider
    Serve,
    /// Search, download and process one provider
    Run { provider: String },
    /// Search and download only
    Download { provider: String },
    /// Run the raster stages over what is already downloaded
    Process {
        provider: String,
        #[arg(long, value_enum, default_value_t = Stage::Tiled)]
        until: Stage,
    },
    /// List asset links without downloading them
    Links {
        provider: String,
        /// minLon,minLat,maxLon,maxLat
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<String>,
    },
    /// Write the settings template
    Template { path: PathBuf },
    /// Print the deepest zoom level for a tile budget
    Zoom { max_tiles: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Merged,
    Reprojected,
    Converted,
    Tiled,
}

impl From<Stage> for StageProgress {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Merged => StageProgress::Merged,
            Stage::Reprojected => StageProgress::Reprojected,
            Stage::Converted => StageProgress::Converted,
            Stage::Tiled => StageProgress::Tiled,
        }
    }
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn pipeline(settings: &Settings, provider: &str) -> Result<PlanetaryPipeline> {
    let pipeline = PlanetaryPipeline::from_settings(settings.provider(provider)?)?;
    Ok(pipeline)
}

async fn serve(settings: &Settings) -> Result<()> {
    let mut pipelines = vec![];
    for provider in &settings.providers {
        let pipeline = Arc::new(PlanetaryPipeline::from_settings(provider)?);
        if provider.bootstrap {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                info!("{}: bootstrap run started", pipeline.name());
                match pipeline.run().await {
                    Ok(report) if report.is_partial() => {
                        warn!("{}: bootstrap run finished with failures", pipeline.name())
                    }
                    Ok(_) => info!("{}: bootstrap run finished", pipeline.name()),
                    Err(e) => error!("{}: bootstrap run failed: {e}", pipeline.name()),
                }
            });
        }
        pipelines.push(pipeline);
    }
    server::serve(&settings.server.bind, Arc::new(AppState::new(pipelines))).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::read(path)?,
        None => Settings::template()?,
    };

    match cli.command {
        Command::Serve => serve(&settings).await?,
        Command::Run { provider } => {
            let report = pipeline(&settings, &provider)?.run().await?;
            print_report(&report)?;
        }
        Command::Download { provider } => {
            let report = pipeline(&settings, &provider)?.acquire().await?;
            print_report(&report)?;
        }
        Command::Process { provider, until } => {
            let report = pipeline(&settings, &provider)?.process(until.into()).await?;
            print_report(&report)?;
        }
        Command::Links { provider, bbox } => {
            let bbox = bbox.as_deref().map(BoundingBox::parse).transpose()?;
            let results = pipeline(&settings, &provider)?.links(bbox).await?;
            print_report(&results)?;
        }
        Command::Template { path } => {
            Settings::template()?.write(&path)?;
            info!("Wrote settings template to {}", path.display());
        }
        Command::Zoom { max_tiles } => println!("{}", calculate_max_zoom(max_tiles)),
    }

    Ok(())
}
