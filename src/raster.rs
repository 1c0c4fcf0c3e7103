mod command;
mod pipeline;

pub use command::{Invocation, RasterCommand};
pub use pipeline::{RasterPipeline, RasterReport};
#[cfg(test)]
pub(crate) use pipeline::tests as fake_tools;

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Deepest zoom level for a tile budget: the highest `z` with `4^z <= budget`,
/// minus one, and never below zero.
pub fn calculate_max_zoom(max_tiles: u64) -> u32 {
    let mut zoom = 0u32;
    while 4u64
        .checked_pow(zoom + 1)
        .is_some_and(|tiles| tiles <= max_tiles)
    {
        zoom += 1;
    }
    zoom.saturating_sub(1)
}

/// Executes one external tool invocation to completion.
pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<()>> + Send;
}

/// Runs tools as child processes inheriting stdio. A child still running when
/// the timeout expires, or when the future is dropped, is killed.
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<()> {
        info!("Running {invocation}");
        let tool = invocation.program.clone();
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ToolSpawn {
                tool: tool.clone(),
                source,
            })?;

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                warn!("{tool} timed out after {:?}, killing it", self.timeout);
                let _ = child.kill().await;
                return Err(Error::ToolTimeout {
                    tool,
                    after: self.timeout,
                });
            }
        };
        if !status.success() {
            return Err(Error::ToolFailed {
                tool,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
