use crate::pipeline::{ExchangeContext, Interceptor, InterceptorFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Counts exchanges in flight
#[derive(Debug)]
pub struct ActivityMonitor {
    active: watch::Sender<usize>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self { active }
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Mark an exchange as started; it ends when the guard drops
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.active.send_modify(|n| *n += 1);
        ActivityGuard {
            monitor: Arc::clone(self),
        }
    }

    fn end(&self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Wait until no exchange has been active for `quiet`, giving up after `timeout`.
    ///
    /// Returns `true` if quiescence was observed.
    pub async fn wait_for_quiescence(&self, quiet: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.subscribe();

        loop {
            let idle = tokio::time::timeout_at(deadline, async {
                active.wait_for(|n| *n == 0).await.map(|_| ())
            })
            .await;
            if !matches!(idle, Ok(Ok(()))) {
                return false;
            }

            let quiet_until = Instant::now() + quiet;
            if quiet_until > deadline {
                return false;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(quiet_until) => return true,
                busy = async { active.wait_for(|n| *n > 0).await.map(|_| ()) } => {
                    if busy.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Decrements the activity counter when dropped
#[derive(Debug)]
pub struct ActivityGuard {
    monitor: Arc<ActivityMonitor>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.monitor.end();
    }
}

/// Holds an [`ActivityGuard`] for as long as the exchange lives
struct ActivityInterceptor {
    _guard: ActivityGuard,
}

impl Interceptor for ActivityInterceptor {}

pub(crate) struct ActivityFactory {
    monitor: Arc<ActivityMonitor>,
}

impl ActivityFactory {
    pub(crate) fn new(monitor: Arc<ActivityMonitor>) -> Arc<dyn InterceptorFactory> {
        Arc::new(Self { monitor })
    }
}

impl InterceptorFactory for ActivityFactory {
    fn name(&self) -> &str {
        "activity"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }
        Some(Box::new(ActivityInterceptor {
            _guard: self.monitor.begin(),
        }))
    }
}
