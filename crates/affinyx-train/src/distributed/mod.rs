//! Data-parallel training across SLURM-allocated processes.

pub mod driver;
pub mod env;
pub mod group;

pub use driver::{broadcast_parameters, run, DistributedArgs, DriverReport};
pub use env::{expand_hostlist, SlurmEnv};
pub use group::{LocalGroup, ProcessGroup, TcpGroup};
