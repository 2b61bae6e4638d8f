pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod utils;

pub use error::{GanError, Result};
