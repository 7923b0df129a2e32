pub mod error;

pub use error::{DriverCode, DriverError, Error, Result};
