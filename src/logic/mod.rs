pub mod auto_merge;
pub mod dag_compactor;
pub mod lock_coordinator;
pub mod maintenance;
pub mod merge;

pub use auto_merge::*;
pub use dag_compactor::*;
pub use lock_coordinator::*;
pub use maintenance::*;
pub use merge::*;
