pub mod audit;
pub mod branch_state;
pub mod commit;
pub mod common;
pub mod lock;
pub mod merge;
pub mod schema;

pub use audit::*;
pub use branch_state::*;
pub use commit::*;
pub use common::*;
pub use lock::*;
pub use merge::*;
pub use schema::*;
