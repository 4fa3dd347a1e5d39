pub mod clock;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DagError, LockError, MergeError};

// Export logic types
pub use logic::{
    AutoMergeCheck, AutoMergeReport, CommitGraph, CompactionOutcome, DagAnalysis, DagCompactor,
    LockCoordinator, LockSettings, MaintenanceHandle, MaintenanceRunner, MergeEngine, MergeOptions,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{CommitStore, LockStore, MemoryStore, PostgresStore, Store};
