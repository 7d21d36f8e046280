pub mod repository;
pub mod snapshot;
pub mod types;

pub use repository::*;
pub use snapshot::*;
pub use types::*;
