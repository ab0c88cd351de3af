use super::{status_code, status_response};
use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hudsucker::Body;
use parking_lot::RwLock;
use skua_core::filter::UrlPattern;
use std::sync::Arc;

/// Default status for requests outside the allowlist
pub const DEFAULT_ALLOWLIST_STATUS: StatusCode = StatusCode::FORBIDDEN;

/// Immutable allowlist state, replaced as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistSnapshot {
    enabled: bool,
    status: StatusCode,
    patterns: Vec<UrlPattern>,
}

impl AllowlistSnapshot {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            status: DEFAULT_ALLOWLIST_STATUS,
            patterns: Vec::new(),
        }
    }

    pub fn enabled(patterns: Vec<UrlPattern>, status: StatusCode) -> Self {
        Self {
            enabled: true,
            status,
            patterns,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(UrlPattern::as_str)
    }

    /// Whether a request must be rejected. CONNECT is never rejected: it only
    /// opens the tunnel, the requests inside it are checked individually.
    pub fn rejects(&self, url: &str, is_connect: bool) -> bool {
        self.enabled && !is_connect && !self.patterns.iter().any(|p| p.matches(url))
    }
}

/// The allowlist. Disabled by default, which lets everything through.
#[derive(Debug)]
pub struct Allowlist {
    current: RwLock<Arc<AllowlistSnapshot>>,
}

impl Default for Allowlist {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(AllowlistSnapshot::disabled())),
        }
    }
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<AllowlistSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Enable with the given patterns; an empty set rejects every non-CONNECT request
    pub fn enable(&self, patterns: &[String], code: u16) -> Result<()> {
        let status = status_code(code)?;
        let patterns = compile_all(patterns)?;
        self.install(AllowlistSnapshot::enabled(patterns, status));
        Ok(())
    }

    pub fn disable(&self) {
        self.install(AllowlistSnapshot::disabled());
    }

    /// Add one pattern to the enabled allowlist
    pub fn add_pattern(&self, pattern: &str) -> Result<()> {
        let compiled = UrlPattern::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;

        let mut guard = self.current.write();
        if !guard.enabled {
            return Err(Error::state(
                "allowlist must be enabled before patterns can be added",
            ));
        }
        let mut next = guard.as_ref().clone();
        next.patterns.push(compiled);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Replace the pattern set, keeping the enabled flag and status
    pub fn set_patterns(&self, patterns: &[String]) -> Result<()> {
        let patterns = compile_all(patterns)?;
        let mut guard = self.current.write();
        let mut next = guard.as_ref().clone();
        next.patterns = patterns;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Drop every pattern; an enabled allowlist then rejects everything
    pub fn clear(&self) {
        let mut guard = self.current.write();
        let mut next = guard.as_ref().clone();
        next.patterns.clear();
        *guard = Arc::new(next);
    }

    fn install(&self, snapshot: AllowlistSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<UrlPattern>> {
    patterns
        .iter()
        .map(|p| UrlPattern::new(p).map_err(|e| Error::InvalidPattern(e.to_string())))
        .collect()
}

/// Short-circuits requests that no allowlist pattern matches
pub struct AllowlistInterceptor {
    allowlist: Arc<Allowlist>,
    ctx: ExchangeContext,
}

impl AllowlistInterceptor {
    pub fn factory(allowlist: Arc<Allowlist>) -> Arc<dyn InterceptorFactory> {
        Arc::new(AllowlistFactory { allowlist })
    }
}

struct AllowlistFactory {
    allowlist: Arc<Allowlist>,
}

impl InterceptorFactory for AllowlistFactory {
    fn name(&self) -> &str {
        "allowlist"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }
        Some(Box::new(AllowlistInterceptor {
            allowlist: Arc::clone(&self.allowlist),
            ctx: ctx.clone(),
        }))
    }
}

#[async_trait]
impl Interceptor for AllowlistInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        let snapshot = self.allowlist.snapshot();
        let url = req.uri().to_string();
        if snapshot.rejects(&url, self.ctx.is_connect()) {
            tracing::debug!("{} is not allowlisted -> {}", url, snapshot.status);
            return Ok(Some(status_response(snapshot.status)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_disabled_passes_everything() {
        let allowlist = Allowlist::new();
        assert!(!allowlist.snapshot().rejects("http://anything/", false));
    }

    #[test]
    fn test_empty_enabled_rejects_all_but_connect() {
        let allowlist = Allowlist::new();
        allowlist.enable(&[], 500).unwrap();

        let snapshot = allowlist.snapshot();
        assert!(snapshot.rejects("http://example.com/", false));
        assert!(snapshot.rejects("https://example.com/", false));
        assert!(!snapshot.rejects("https://example.com:443", true));
        assert_eq!(snapshot.status_code(), 500);
    }

    #[test]
    fn test_add_pattern_incrementally() {
        let allowlist = Allowlist::new();
        allowlist.enable(&[], 403).unwrap();
        allowlist.add_pattern("http://good\\.test/.*").unwrap();

        let snapshot = allowlist.snapshot();
        assert!(!snapshot.rejects("http://good.test/page", false));
        assert!(snapshot.rejects("http://bad.test/page", false));
        assert_eq!(snapshot.patterns().count(), 1);
    }

    #[test]
    fn test_enable_rejects_invalid_status() {
        let allowlist = Allowlist::new();
        assert!(matches!(allowlist.enable(&[], 1000), Err(Error::Config(_))));
        assert!(!allowlist.snapshot().is_enabled());
    }

    #[test]
    fn test_add_pattern_while_disabled_is_a_state_error() {
        let allowlist = Allowlist::new();
        assert!(matches!(
            allowlist.add_pattern("http://x/.*"),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn test_concurrent_additions_are_not_lost() {
        let allowlist = Arc::new(Allowlist::new());
        allowlist.enable(&[], 403).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let allowlist = Arc::clone(&allowlist);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        allowlist
                            .add_pattern(&format!("http://host{}-{}/.*", i, j))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allowlist.snapshot().patterns().count(), 200);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let allowlist = Allowlist::new();
        allowlist.enable(&patterns(&["http://a/.*"]), 403).unwrap();
        let before = allowlist.snapshot();
        allowlist.disable();
        assert!(before.is_enabled());
        assert!(!allowlist.snapshot().is_enabled());
    }

    #[tokio::test]
    async fn test_interceptor_is_skipped_for_connect() {
        let allowlist = Arc::new(Allowlist::new());
        allowlist.enable(&[], 403).unwrap();
        let factory = AllowlistInterceptor::factory(Arc::clone(&allowlist));

        let connect = Request::builder()
            .method(http::Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();
        assert!(factory
            .new_instance(&ExchangeContext::from_request(None, &connect))
            .is_none());

        let mut get = Request::builder()
            .uri("http://example.com/")
            .body(Body::empty())
            .unwrap();
        let mut instance = factory
            .new_instance(&ExchangeContext::from_request(None, &get))
            .unwrap();
        let response = instance.on_request(&mut get).await.unwrap().unwrap();
        assert_eq!(response.status().as_u16(), 403);
    }
}
