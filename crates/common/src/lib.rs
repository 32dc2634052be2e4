pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{HiveError, HiveResult};
pub use types::*;
