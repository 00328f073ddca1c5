pub mod catalog;
pub mod color;
pub mod detect;
pub mod error;
pub mod imprint;
pub mod logging;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod settings;

pub use catalog::{CatalogRecord, CatalogStore, InMemoryCatalog, SearchQuery};
pub use color::ColorLabel;
pub use error::{DecodeError, StepError};
pub use matcher::{MatchCandidate, MatchTier};
pub use pipeline::{Analysis, CropAnalysis, Pipeline};
pub use settings::{Settings, load_settings};
