use super::{calculate_max_zoom, RasterCommand, ToolRunner};
use crate::error::{Error, Result};
use crate::layout::{ProviderLayout, StageProgress};
use crate::settings::RasterSettings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STAGES: [StageProgress; 4] = [
    StageProgress::Merged,
    StageProgress::Reprojected,
    StageProgress::Converted,
    StageProgress::Tiled,
];

#[derive(Debug, Clone, Serialize)]
pub struct RasterReport {
    /// Progress found on disk before this run.
    pub resumed_from: StageProgress,
    pub executed: Vec<StageProgress>,
    pub reached: StageProgress,
    /// Intermediates deleted after tiling.
    pub removed: Vec<PathBuf>,
}

/// Merge, reproject, rescale and tile the downloaded rasters, skipping every
/// stage whose output is already on disk.
pub struct RasterPipeline<R> {
    runner: R,
    layout: ProviderLayout,
    settings: RasterSettings,
}

impl<R: ToolRunner> RasterPipeline<R> {
    pub fn new(runner: R, layout: ProviderLayout, settings: RasterSettings) -> Self {
        Self {
            runner,
            layout,
            settings,
        }
    }

    pub fn layout(&self) -> &ProviderLayout {
        &self.layout
    }

    pub async fn run_until(&self, target: StageProgress) -> Result<RasterReport> {
        let resumed_from = self.layout.probe();
        let mut report = RasterReport {
            resumed_from,
            executed: vec![],
            reached: resumed_from,
            removed: vec![],
        };
        if resumed_from >= target {
            info!("Raster pipeline already at {resumed_from:?}");
        }

        for stage in STAGES {
            if stage <= resumed_from {
                debug!("Skipping {stage:?}, output exists");
                continue;
            }
            if stage > target {
                break;
            }
            info!("Running raster stage {stage:?}");
            self.run_stage(stage).await?;
            report.executed.push(stage);
            report.reached = stage;
        }

        if report.reached == StageProgress::Tiled {
            report.removed = self.clean_up().await?;
        }
        Ok(report)
    }

    async fn run_stage(&self, stage: StageProgress) -> Result<()> {
        let layout = &self.layout;
        let tools = &self.settings.tools;
        match stage {
            StageProgress::NotStarted => Ok(()),
            StageProgress::Merged => {
                let inputs = layout.source_rasters()?;
                if inputs.is_empty() {
                    return Err(Error::NoSourceRasters(layout.sources_dir()));
                }
                let output = layout.merged();
                let command = RasterCommand::Merge {
                    inputs: &inputs,
                    output: &output,
                };
                self.run_producing(command.invocation(tools), &output).await
            }
            StageProgress::Reprojected => {
                let input = require(layout.merged())?;
                let output = layout.reprojected();
                let command = RasterCommand::Reproject {
                    srs: &self.settings.target_srs,
                    input: &input,
                    output: &output,
                };
                self.run_producing(command.invocation(tools), &output).await
            }
            StageProgress::Converted => {
                let input = require(layout.reprojected())?;
                let output = layout.byte_vrt();
                let command = RasterCommand::Convert {
                    input: &input,
                    output: &output,
                };
                self.run_producing(command.invocation(tools), &output).await
            }
            StageProgress::Tiled => {
                let input = require(layout.byte_vrt())?;
                let partial = layout.tiles_partial();
                remove_path(&partial).await?;
                let command = RasterCommand::Tile {
                    processes: self.settings.processes,
                    max_zoom: calculate_max_zoom(self.settings.max_tiles),
                    profile: &self.settings.profile,
                    xyz: self.settings.xyz,
                    input: &input,
                    output_dir: &partial,
                };
                self.run_producing(command.invocation(tools), &partial).await?;
                tokio::fs::rename(&partial, layout.tiles_dir()).await?;
                Ok(())
            }
        }
    }

    /// Runs a tool and removes whatever it left at `output` if it failed, so a
    /// half-written artifact is never mistaken for a finished stage.
    async fn run_producing(
        &self,
        invocation: super::Invocation,
        output: &Path,
    ) -> Result<()> {
        if let Err(e) = self.runner.run(&invocation).await {
            warn!("{} failed: {e}", invocation.program);
            remove_path(output).await?;
            return Err(e);
        }
        Ok(())
    }

    async fn clean_up(&self) -> Result<Vec<PathBuf>> {
        let mut removed = vec![];
        let mut candidates = vec![
            self.layout.merged(),
            self.layout.reprojected(),
            self.layout.byte_vrt(),
        ];
        if self.settings.purge_sources {
            candidates.push(self.layout.sources_dir());
        }
        for path in candidates {
            if remove_path(&path).await? {
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            info!("Removed {} intermediate artifacts", removed.len());
        }
        Ok(removed)
    }
}

fn require(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::MissingArtifact(path))
    }
}

async fn remove_path(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::download::tests::test_dir;
    use crate::raster::Invocation;
    use std::sync::{Arc, Mutex};

    /// Pretends to be GDAL: writes each stage's output, or fails for the
    /// configured program.
    #[derive(Default)]
    pub struct FakeTools {
        pub invocations: Mutex<Vec<Invocation>>,
        pub fail_program: Mutex<Option<String>>,
    }

    impl FakeTools {
        pub fn programs(&self) -> Vec<String> {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .map(|i| i.program.clone())
                .collect()
        }
    }

    impl ToolRunner for Arc<FakeTools> {
        async fn run(&self, invocation: &Invocation) -> Result<()> {
            self.invocations.lock().unwrap().push(invocation.clone());
            let output = match invocation.args.first().map(String::as_str) {
                Some("-o") => PathBuf::from(&invocation.args[1]),
                _ => PathBuf::from(invocation.args.last().unwrap()),
            };
            if invocation.program == "gdal2tiles.py" {
                let tile_dir = output.join("0").join("0");
                std::fs::create_dir_all(&tile_dir).unwrap();
                std::fs::write(tile_dir.join("0.png"), b"png").unwrap();
            } else {
                std::fs::write(&output, invocation.program.as_bytes()).unwrap();
            }

            let fail = self.fail_program.lock().unwrap().clone();
            if fail.as_deref() == Some(invocation.program.as_str()) {
                return Err(Error::ToolFailed {
                    tool: invocation.program.clone(),
                    status: "exit status: 1".to_string(),
                });
            }
            Ok(())
        }
    }

    pub fn layout_with_sources(name: &str) -> ProviderLayout {
        let layout = ProviderLayout::new(test_dir(name));
        std::fs::create_dir_all(layout.sources_dir()).unwrap();
        for file in ["h08v05.tif", "h09v05.tif"] {
            std::fs::write(layout.sources_dir().join(file), b"tif").unwrap();
        }
        layout
    }

    fn pipeline(tools: &Arc<FakeTools>, layout: ProviderLayout) -> RasterPipeline<Arc<FakeTools>> {
        RasterPipeline::new(tools.clone(), layout, RasterSettings::default())
    }

    #[tokio::test]
    async fn test_full_run_and_cleanup() {
        let tools = Arc::new(FakeTools::default());
        let layout = layout_with_sources("raster_full");
        let pipeline = pipeline(&tools, layout.clone());

        let report = pipeline.run_until(StageProgress::Tiled).await.unwrap();
        assert_eq!(report.resumed_from, StageProgress::NotStarted);
        assert_eq!(report.executed, STAGES.to_vec());
        assert_eq!(
            tools.programs(),
            vec!["gdal_merge.py", "gdalwarp", "gdal_translate", "gdal2tiles.py"]
        );
        assert!(layout.tiles_dir().join("0/0/0.png").is_file());
        assert!(!layout.tiles_partial().exists());
        assert!(!layout.merged().exists());
        assert!(!layout.byte_vrt().exists());
        assert_eq!(report.removed.len(), 3);
        assert_eq!(layout.source_rasters().unwrap().len(), 2);

        let tile = &tools.invocations.lock().unwrap()[3];
        assert!(tile.args.contains(&"0-3".to_string()));
    }

    #[tokio::test]
    async fn test_resume_after_reproject() {
        let tools = Arc::new(FakeTools::default());
        let layout = layout_with_sources("raster_resume");
        std::fs::write(layout.merged(), b"m").unwrap();
        std::fs::write(layout.reprojected(), b"r").unwrap();
        let pipeline = pipeline(&tools, layout.clone());

        let report = pipeline.run_until(StageProgress::Tiled).await.unwrap();
        assert_eq!(report.resumed_from, StageProgress::Reprojected);
        assert_eq!(
            report.executed,
            vec![StageProgress::Converted, StageProgress::Tiled]
        );
        assert_eq!(tools.programs(), vec!["gdal_translate", "gdal2tiles.py"]);
    }

    #[tokio::test]
    async fn test_run_until_stops_early() {
        let tools = Arc::new(FakeTools::default());
        let layout = layout_with_sources("raster_until");
        let pipeline = pipeline(&tools, layout.clone());

        let report = pipeline.run_until(StageProgress::Merged).await.unwrap();
        assert_eq!(report.reached, StageProgress::Merged);
        assert_eq!(tools.programs(), vec!["gdal_merge.py"]);
        assert!(layout.merged().is_file());
        assert!(report.removed.is_empty());

        pipeline.run_until(StageProgress::Merged).await.unwrap();
        assert_eq!(tools.programs().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_aborts_later_stages() {
        let tools = Arc::new(FakeTools::default());
        *tools.fail_program.lock().unwrap() = Some("gdalwarp".to_string());
        let layout = layout_with_sources("raster_failure");
        let pipeline = pipeline(&tools, layout.clone());

        let err = pipeline.run_until(StageProgress::Tiled).await.unwrap_err();
        assert!(matches!(err, Error::ToolFailed { .. }));
        assert_eq!(tools.programs(), vec!["gdal_merge.py", "gdalwarp"]);
        assert!(layout.merged().is_file());
        assert!(!layout.reprojected().exists());
        assert_eq!(layout.probe(), StageProgress::Merged);
    }

    #[tokio::test]
    async fn test_failed_tiling_leaves_no_tiles_dir() {
        let tools = Arc::new(FakeTools::default());
        *tools.fail_program.lock().unwrap() = Some("gdal2tiles.py".to_string());
        let layout = layout_with_sources("raster_tiles_failure");
        let pipeline = pipeline(&tools, layout.clone());

        assert!(pipeline.run_until(StageProgress::Tiled).await.is_err());
        assert!(!layout.tiles_dir().exists());
        assert!(!layout.tiles_partial().exists());
        assert_eq!(layout.probe(), StageProgress::Converted);
    }

    #[tokio::test]
    async fn test_no_sources() {
        let tools = Arc::new(FakeTools::default());
        let layout = ProviderLayout::new(test_dir("raster_empty"));
        let pipeline = pipeline(&tools, layout);

        let err = pipeline.run_until(StageProgress::Tiled).await.unwrap_err();
        assert!(matches!(err, Error::NoSourceRasters(_)));
        assert!(tools.programs().is_empty());
    }

    #[tokio::test]
    async fn test_purge_sources() {
        let tools = Arc::new(FakeTools::default());
        let layout = layout_with_sources("raster_purge");
        let settings = RasterSettings {
            purge_sources: true,
            ..RasterSettings::default()
        };
        let pipeline = RasterPipeline::new(tools.clone(), layout.clone(), settings);

        let report = pipeline.run_until(StageProgress::Tiled).await.unwrap();
        assert!(report.removed.contains(&layout.sources_dir()));
        assert!(!layout.sources_dir().exists());
        assert_eq!(layout.probe(), StageProgress::Tiled);
    }
}
