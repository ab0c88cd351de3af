//! Traffic policies applied to every exchange.
//!
//! Each policy is a piece of shared state read by many exchanges and written
//! occasionally through the control API. Lists are copy-on-write: readers take
//! an `Arc` snapshot and iterate it without holding any lock.

mod allowlist;
mod auth;
mod blocklist;
mod headers;
mod rewrite;
mod shaping;

pub use allowlist::{Allowlist, AllowlistInterceptor, AllowlistSnapshot};
pub use auth::{AutoAuthInterceptor, AutoAuthenticator, basic_credentials};
pub use blocklist::{Blocklist, BlocklistEntry, BlocklistInterceptor};
pub use headers::{AdditionalHeaders, AdditionalHeadersInterceptor};
pub use rewrite::{OriginalUrl, RewriteInterceptor, RewriteRule, RewriteRules};
pub use shaping::{BandwidthLimits, LatencyInterceptor, TrafficShaping};

use parking_lot::RwLock;
use std::sync::Arc;

/// An ordered list whose writers replace the whole list.
#[derive(Debug)]
pub(crate) struct SnapshotList<T> {
    current: RwLock<Arc<Vec<T>>>,
}

impl<T: Clone> SnapshotList<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            current: RwLock::new(Arc::new(items)),
        }
    }

    /// The current list; later writes never affect the returned snapshot
    pub(crate) fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.current.read())
    }

    pub(crate) fn replace(&self, items: Vec<T>) {
        *self.current.write() = Arc::new(items);
    }

    /// Copy, modify and install under the write lock
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut guard = self.current.write();
        let mut next = guard.as_ref().clone();
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }
}

impl<T: Clone> Default for SnapshotList<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Validate a configured status code
pub(crate) fn status_code(code: u16) -> crate::Result<http::StatusCode> {
    http::StatusCode::from_u16(code)
        .map_err(|_| crate::Error::Config(format!("Invalid HTTP status code: {}", code)))
}

/// Build an empty-bodied response with the given status
pub(crate) fn status_response(status: http::StatusCode) -> http::Response<hudsucker::Body> {
    let mut response = http::Response::new(hudsucker::Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(http::header::CONTENT_LENGTH, http::HeaderValue::from_static("0"));
    response
}
