//! affinyx-common: shared option types, errors and configuration used across all affinyx crates.

pub mod config;
pub mod error;
pub mod layout;
pub mod options;
pub mod run_config;

// Re-export commonly used types
pub use config::{Config, DistributedConfig, HubConfig, PathsConfig};
pub use error::{CommonError, Result};
pub use layout::ResultsLayout;
pub use options::{DataOpt, LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt};
pub use run_config::{ArchParams, ModelKey, RunConfig};
