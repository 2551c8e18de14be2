pub mod constants;
pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod spawn_utils;
pub mod speed_estimator;

pub use error::Error;
pub use hash_id::Id16;
