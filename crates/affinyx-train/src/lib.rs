//! Affinyx training: the training loop, checkpointing, metrics and the
//! distributed data-parallel driver.

pub mod dataset;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod saver;
pub mod session;
pub mod trainer;

pub use dataset::{AffinityDataset, AffinitySample, Batch, DataLoader, DatasetSplits, Split};
pub use distributed::{LocalGroup, ProcessGroup, SlurmEnv, TcpGroup};
pub use error::{Result, TrainError};
pub use metrics::{upsert_stats, RegressionMetrics, StatsRow};
pub use saver::{CheckpointSaver, EarlyStopping, Retention};
pub use session::{load_splits, min_delta_for, Loaders, RunSession};
pub use trainer::{EpochRecord, Predictions, RunOutcome, Trainer, TrainingLog, SENTINEL_LOSS};
