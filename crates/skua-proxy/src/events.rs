//! Transport callbacks delivered to an exchange.
//!
//! The transport reports every phase of an exchange with the monotonic instant
//! at which it happened. Listeners must tolerate callbacks that are missing or
//! arrive out of order.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// Receives the transport's view of one exchange
pub trait ExchangeListener: Send + Sync {
    fn resolution_started(&self, _at: Instant) {}
    fn resolution_succeeded(&self, _at: Instant, _address: IpAddr) {}
    fn resolution_failed(&self, _at: Instant, _host: &str) {}
    fn connection_queued(&self, _at: Instant) {}
    fn connection_started(&self, _at: Instant) {}
    fn ssl_started(&self, _at: Instant) {}
    fn ssl_succeeded(&self, _at: Instant) {}
    fn connection_succeeded(&self, _at: Instant) {}
    fn connection_failed(&self, _at: Instant, _host: &str) {}
    /// The request went out on a pooled connection
    fn connection_reused(&self, _at: Instant) {}
    fn request_sending(&self, _at: Instant) {}
    fn request_body_chunk(&self, _len: usize) {}
    fn request_sent(&self, _at: Instant) {}
    fn response_receiving(&self, _at: Instant) {}
    fn response_body_chunk(&self, _len: usize) {}
    fn response_received(&self, _at: Instant) {}
    fn response_timed_out(&self, _at: Instant) {}
}

/// Fans every callback out to the listeners registered for an exchange
#[derive(Clone, Default)]
pub struct ExchangeEvents {
    listeners: Arc<[Arc<dyn ExchangeListener>]>,
}

impl ExchangeEvents {
    pub fn new(listeners: Vec<Arc<dyn ExchangeListener>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn ExchangeListener)) {
        for listener in self.listeners.iter() {
            f(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for ExchangeEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeEvents")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ExchangeListener for ExchangeEvents {
    fn resolution_started(&self, at: Instant) {
        self.each(|l| l.resolution_started(at));
    }

    fn resolution_succeeded(&self, at: Instant, address: IpAddr) {
        self.each(|l| l.resolution_succeeded(at, address));
    }

    fn resolution_failed(&self, at: Instant, host: &str) {
        self.each(|l| l.resolution_failed(at, host));
    }

    fn connection_queued(&self, at: Instant) {
        self.each(|l| l.connection_queued(at));
    }

    fn connection_started(&self, at: Instant) {
        self.each(|l| l.connection_started(at));
    }

    fn ssl_started(&self, at: Instant) {
        self.each(|l| l.ssl_started(at));
    }

    fn ssl_succeeded(&self, at: Instant) {
        self.each(|l| l.ssl_succeeded(at));
    }

    fn connection_succeeded(&self, at: Instant) {
        self.each(|l| l.connection_succeeded(at));
    }

    fn connection_failed(&self, at: Instant, host: &str) {
        self.each(|l| l.connection_failed(at, host));
    }

    fn connection_reused(&self, at: Instant) {
        self.each(|l| l.connection_reused(at));
    }

    fn request_sending(&self, at: Instant) {
        self.each(|l| l.request_sending(at));
    }

    fn request_body_chunk(&self, len: usize) {
        self.each(|l| l.request_body_chunk(len));
    }

    fn request_sent(&self, at: Instant) {
        self.each(|l| l.request_sent(at));
    }

    fn response_receiving(&self, at: Instant) {
        self.each(|l| l.response_receiving(at));
    }

    fn response_body_chunk(&self, len: usize) {
        self.each(|l| l.response_body_chunk(len));
    }

    fn response_received(&self, at: Instant) {
        self.each(|l| l.response_received(at));
    }

    fn response_timed_out(&self, at: Instant) {
        self.each(|l| l.response_timed_out(at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        chunks: AtomicUsize,
    }

    impl ExchangeListener for Counter {
        fn response_body_chunk(&self, len: usize) {
            self.chunks.fetch_add(len, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fan_out_reaches_every_listener() {
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let events = ExchangeEvents::new(vec![first.clone(), second.clone()]);

        events.response_body_chunk(10);
        events.response_body_chunk(5);
        events.request_sent(Instant::now());

        assert_eq!(first.chunks.load(Ordering::SeqCst), 15);
        assert_eq!(second.chunks.load(Ordering::SeqCst), 15);
    }
}
