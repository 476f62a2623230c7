//! Random hyperparameter search over affinyx training runs.
//!
//! A [`SearchSpace`] fixes the dataset and feature options and samples the
//! optimiser and architecture parameters; the [`Tuner`] trains one
//! configuration per trial and keeps the trial with the lowest final
//! validation loss.

pub mod error;
pub mod space;
pub mod trial;
pub mod tuner;

pub use error::{Result, TuneError};
pub use space::{ParamDistribution, Sample, SearchSpace};
pub use trial::{TrialContext, TrialResult, TrialRunner};
pub use tuner::{TrialRecord, TrialStatus, TuneExperiment, Tuner, TunerConfig, DEFAULT_NUM_SAMPLES};
