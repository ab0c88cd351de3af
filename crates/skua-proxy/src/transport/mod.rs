//! Upstream transport: connector, shaped stream and metered bodies.
//!
//! The connector stamps every connection phase and attaches the stamps to the
//! connection, so they reach the exchange that opened it through the response
//! extensions. Failures carry the same stamps inside [`ConnectError`].

mod body;
mod connector;
mod stream;
mod tls;

pub(crate) use body::{Direction, MeteredBody};
pub use connector::{ConnectError, ConnectInfo, ConnectTimings, UpstreamConnector};
pub use stream::UpstreamStream;
pub(crate) use tls::client_config;

use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect and response-idle timeouts, adjustable while running. Zero disables.
#[derive(Debug)]
pub struct Timeouts {
    connect_ms: AtomicU64,
    idle_ms: AtomicU64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT)
    }
}

impl Timeouts {
    pub fn new(connect: Duration, idle: Duration) -> Self {
        Self {
            connect_ms: AtomicU64::new(as_millis(connect)),
            idle_ms: AtomicU64::new(as_millis(idle)),
        }
    }

    pub fn connect(&self) -> Option<Duration> {
        nonzero(self.connect_ms.load(Ordering::Relaxed))
    }

    pub fn idle(&self) -> Option<Duration> {
        nonzero(self.idle_ms.load(Ordering::Relaxed))
    }

    pub fn set_connect(&self, timeout: Duration) {
        self.connect_ms.store(as_millis(timeout), Ordering::Relaxed);
    }

    pub fn set_idle(&self, timeout: Duration) {
        self.idle_ms.store(as_millis(timeout), Ordering::Relaxed);
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn nonzero(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Whether an error, or anything in its source chain, is an I/O timeout
pub(crate) fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>()
            && io.kind() == io::ErrorKind::TimedOut
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// The first [`ConnectError`] in an error's source chain
pub(crate) fn find_connect_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ConnectError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(connect) = e.downcast_ref::<ConnectError>() {
            return Some(connect);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped")]
    struct Wrapped(#[source] io::Error);

    #[test]
    fn test_timeout_found_in_source_chain() {
        let err = Wrapped(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(is_timeout(&err));

        let other = Wrapped(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!is_timeout(&other));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect(), Some(DEFAULT_CONNECT_TIMEOUT));
        timeouts.set_idle(Duration::ZERO);
        assert_eq!(timeouts.idle(), None);
    }
}
