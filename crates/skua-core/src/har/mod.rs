mod types;
mod writer;

pub use types::*;
pub use writer::HarWriter;
