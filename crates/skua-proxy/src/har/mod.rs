//! HAR capture: the document/page manager and the per-exchange recorder.

mod content;
mod log;
mod recorder;

pub use log::{CaptureDocument, HarManager};
pub(crate) use recorder::HarCaptureFactory;
