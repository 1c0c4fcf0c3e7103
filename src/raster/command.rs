use crate::settings::ToolSettings;
use std::fmt;
use std::path::{Path, PathBuf};

/// A program and its arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub enum RasterCommand<'a> {
    Merge {
        inputs: &'a [PathBuf],
        output: &'a Path,
    },
    Reproject {
        srs: &'a str,
        input: &'a Path,
        output: &'a Path,
    },
    /// Rescale to 8 bit into a virtual raster.
    Convert {
        input: &'a Path,
        output: &'a Path,
    },
    Tile {
        processes: u32,
        max_zoom: u32,
        profile: &'a str,
        xyz: bool,
        input: &'a Path,
        output_dir: &'a Path,
    },
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl RasterCommand<'_> {
    pub fn invocation(&self, tools: &ToolSettings) -> Invocation {
        let (program, args) = match self {
            Self::Merge { inputs, output } => {
                let mut args = vec!["-o".to_string(), arg(output)];
                args.extend(inputs.iter().map(|p| arg(p)));
                (&tools.merge, args)
            }
            Self::Reproject { srs, input, output } => (
                &tools.warp,
                vec!["-t_srs".to_string(), srs.to_string(), arg(input), arg(output)],
            ),
            Self::Convert { input, output } => (
                &tools.translate,
                vec![
                    "-of".to_string(),
                    "VRT".to_string(),
                    "-ot".to_string(),
                    "Byte".to_string(),
                    "-scale".to_string(),
                    arg(input),
                    arg(output),
                ],
            ),
            Self::Tile {
                processes,
                max_zoom,
                profile,
                xyz,
                input,
                output_dir,
            } => {
                let mut args = vec![
                    format!("--processes={processes}"),
                    "-z".to_string(),
                    format!("0-{max_zoom}"),
                    "-p".to_string(),
                    profile.to_string(),
                ];
                if *xyz {
                    args.push("--xyz".to_string());
                }
                args.push(arg(input));
                args.push(arg(output_dir));
                (&tools.tile, args)
            }
        };
        Invocation {
            program: program.clone(),
            args,
        }
    }
}
