use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory};
use async_trait::async_trait;
use http::Response;
use hudsucker::Body;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte-per-second caps read by the transport on every I/O. Zero means unlimited.
#[derive(Debug, Default)]
pub struct BandwidthLimits {
    read_bytes_per_sec: AtomicU64,
    write_bytes_per_sec: AtomicU64,
}

impl BandwidthLimits {
    pub fn new(read_bytes_per_sec: u64, write_bytes_per_sec: u64) -> Self {
        Self {
            read_bytes_per_sec: AtomicU64::new(read_bytes_per_sec),
            write_bytes_per_sec: AtomicU64::new(write_bytes_per_sec),
        }
    }

    pub fn read_limit(&self) -> Option<u64> {
        nonzero(self.read_bytes_per_sec.load(Ordering::Relaxed))
    }

    pub fn write_limit(&self) -> Option<u64> {
        nonzero(self.write_bytes_per_sec.load(Ordering::Relaxed))
    }

    pub fn set_read_limit(&self, bytes_per_sec: u64) {
        self.read_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn set_write_limit(&self, bytes_per_sec: u64) {
        self.write_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }
}

fn nonzero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// Latency and bandwidth settings, adjustable while the proxy runs
#[derive(Debug, Default)]
pub struct TrafficShaping {
    latency_ms: AtomicU64,
    bandwidth: Arc<BandwidthLimits>,
}

impl TrafficShaping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// Shared with every upstream stream the transport opens
    pub fn bandwidth(&self) -> Arc<BandwidthLimits> {
        Arc::clone(&self.bandwidth)
    }
}

/// Holds the response back until the configured latency has passed since the
/// exchange began. Time already spent upstream counts toward it.
pub struct LatencyInterceptor {
    latency: Duration,
    started: Instant,
}

impl LatencyInterceptor {
    pub fn factory(shaping: Arc<TrafficShaping>) -> Arc<dyn InterceptorFactory> {
        Arc::new(LatencyFactory { shaping })
    }
}

struct LatencyFactory {
    shaping: Arc<TrafficShaping>,
}

impl InterceptorFactory for LatencyFactory {
    fn name(&self) -> &str {
        "latency"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        let latency = self.shaping.latency();
        if ctx.is_connect() || latency.is_zero() {
            return None;
        }
        Some(Box::new(LatencyInterceptor {
            latency,
            started: Instant::now(),
        }))
    }
}

#[async_trait]
impl Interceptor for LatencyInterceptor {
    async fn on_response(&mut self, _res: &mut Response<Body>) -> HookResult<()> {
        let remaining = self.latency.saturating_sub(self.started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        Ok(())
    }
}
