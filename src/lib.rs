pub mod download;
pub mod download_plan;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod planetary;
pub mod raster;
pub mod search;
pub mod server;
pub mod settings;
pub mod signing;
pub mod tiles;

pub use error::{Error, Result};
pub use layout::StageProgress;
pub use orchestrator::{PlanetaryPipeline, ProviderPipeline};
pub use raster::calculate_max_zoom;
pub use settings::Settings;
