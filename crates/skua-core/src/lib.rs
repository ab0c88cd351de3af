pub mod assertions;
pub mod capture;
pub mod error;
pub mod filter;
pub mod har;

pub use capture::{CaptureType, CaptureTypeSet};
pub use error::{Error, Result};
