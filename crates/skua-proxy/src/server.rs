//! Proxy lifecycle and control API.
//!
//! A [`ProxyServer`] runs hudsucker on a background task. Everything an
//! embedder can change at runtime is reached through it and lands in the
//! shared [`ProxyState`], which in-flight exchanges read.

use crate::config::ProxyConfig;
use crate::handler::InterceptingHandler;
use crate::har::CaptureDocument;
use crate::pipeline::InterceptorFactory;
use crate::policy::{BlocklistEntry, RewriteRule};
use crate::router::UpstreamProxy;
use crate::state::ProxyState;
use crate::transport::{UpstreamConnector, client_config};
use crate::{CertificateAuthority, Error, Result};
use hudsucker::Proxy;
use parking_lot::Mutex;
use skua_core::CaptureTypeSet;
use skua_core::assertions::{self, Assertion, AssertionResult};
use skua_core::filter::UrlPattern;
use skua_core::har::{Creator, Entry, Har};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long `stop()` lets in-flight exchanges finish
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

/// Settings fixed once the proxy starts
#[derive(Debug, Clone, Copy)]
struct StartupSettings {
    bind: SocketAddr,
    mitm: bool,
    trust_all_servers: bool,
}

/// MITM proxy server for capturing and shaping HTTP/HTTPS traffic
pub struct ProxyServer {
    ca: CertificateAuthority,
    state: Arc<ProxyState>,
    settings: Mutex<StartupSettings>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    started: AtomicBool,
    aborted: Arc<AtomicBool>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, ca: CertificateAuthority) -> Result<Self> {
        let state = ProxyState::new(config.router()?, config.timeouts(), config.capture_types.clone());
        state.shaping.set_latency(Duration::from_millis(config.latency_ms));
        state.shaping.bandwidth().set_read_limit(config.read_bandwidth_limit);
        state.shaping.bandwidth().set_write_limit(config.write_bandwidth_limit);
        if !config.additional_headers.is_empty() {
            state.headers.set_all(config.additional_headers.clone())?;
        }

        Ok(Self {
            ca,
            state: Arc::new(state),
            settings: Mutex::new(StartupSettings {
                bind: config.socket_addr(),
                mitm: config.mitm,
                trust_all_servers: config.trust_all_servers,
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
            started: AtomicBool::new(false),
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared state read by every exchange
    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Start on the configured address, returning the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind = self.settings.lock().bind;
        self.start_on(bind).await
    }

    /// Start on `addr`; port 0 picks an ephemeral port
    pub async fn start_on(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(Error::state("Proxy is already running")),
            Lifecycle::Stopped => return Err(Error::state("Proxy has been stopped and cannot be restarted")),
        }

        let settings = {
            let mut settings = self.settings.lock();
            settings.bind = addr;
            *settings
        };
        // Without interception hudsucker opens CONNECT tunnels itself
        if !settings.mitm && self.state.router.upstream().is_some() {
            return Err(Error::state(
                "A chained proxy requires MITM; HTTPS tunnels would bypass it",
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Starting proxy server on {}", local);

        let connector = UpstreamConnector::new(
            Arc::clone(&self.state.router),
            client_config(settings.trust_all_servers)?,
            Arc::clone(&self.state.timeouts),
            self.state.shaping.bandwidth(),
        );
        let handler = InterceptingHandler::new(
            Arc::clone(&self.state),
            settings.mitm,
            Arc::clone(&self.aborted),
        );
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(self.ca.authority()?)
            .with_http_connector(connector)
            .with_http_handler(handler)
            .with_graceful_shutdown(async move {
                let _ = shutdown_signal.await;
            })
            .build()
            .map_err(|e| Error::Proxy(format!("Failed to build proxy: {}", e)))?;

        let task = tokio::spawn(async move {
            proxy
                .start()
                .await
                .map_err(|e| Error::Proxy(format!("Proxy failed: {}", e)))
        });

        self.started.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running(Running {
            addr: local,
            shutdown,
            task,
        });
        tracing::info!("Proxy server listening on http://{}", local);
        Ok(local)
    }

    /// The bound port while running
    pub async fn port(&self) -> Option<u16> {
        self.local_addr().await.map(|addr| addr.port())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(running) => Some(running.addr),
            _ => None,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    /// Stop accepting exchanges and give in-flight ones a grace period
    pub async fn stop(&self) -> Result<()> {
        self.stop_within(DEFAULT_STOP_GRACE).await
    }

    pub async fn stop_within(&self, grace: Duration) -> Result<()> {
        let running = self.take_running().await?;
        tracing::info!("Stopping proxy server on {}", running.addr);
        let _ = running.shutdown.send(());

        let mut task = running.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => tracing::warn!("Proxy task ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!(
                    "In-flight exchanges did not finish within {} ms; aborting",
                    grace.as_millis()
                );
                self.aborted.store(true, Ordering::Release);
                task.abort();
            }
        }
        tracing::info!("Proxy stopped");
        Ok(())
    }

    /// Stop immediately, cutting off in-flight exchanges
    pub async fn abort(&self) -> Result<()> {
        let running = self.take_running().await?;
        tracing::info!("Aborting proxy server on {}", running.addr);
        self.aborted.store(true, Ordering::Release);
        let _ = running.shutdown.send(());
        running.task.abort();
        Ok(())
    }

    async fn take_running(&self) -> Result<Running> {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => Ok(running),
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                Err(Error::state("Proxy is not running"))
            }
            Lifecycle::Stopped => Err(Error::state("Proxy is already stopped")),
        }
    }

    fn ensure_not_started(&self, setting: &str) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::state(format!(
                "{} cannot be changed after the proxy has started",
                setting
            )));
        }
        Ok(())
    }

    pub fn set_mitm(&self, mitm: bool) -> Result<()> {
        self.ensure_not_started("MITM")?;
        self.settings.lock().mitm = mitm;
        Ok(())
    }

    pub fn is_mitm(&self) -> bool {
        self.settings.lock().mitm
    }

    pub fn set_trust_all_servers(&self, trust_all: bool) -> Result<()> {
        self.ensure_not_started("Upstream certificate trust")?;
        self.settings.lock().trust_all_servers = trust_all;
        Ok(())
    }

    // HAR lifecycle

    /// Start a new HAR. The previous document is returned live; exchanges
    /// still in flight finish writing into it.
    pub fn new_har(&self, page_ref: Option<&str>, title: Option<&str>) -> Option<Arc<CaptureDocument>> {
        self.state.har.new_har(page_ref, title)
    }

    pub fn new_page(&self, page_ref: Option<&str>, title: Option<&str>) -> Option<Har> {
        self.state.har.new_page(page_ref, title)
    }

    pub fn end_page(&self) {
        self.state.har.end_page();
    }

    pub fn end_har(&self) -> Option<Arc<CaptureDocument>> {
        self.state.har.end_har()
    }

    pub fn get_har(&self, clean: bool) -> Option<Arc<CaptureDocument>> {
        self.state.har.get_har(clean)
    }

    // Capture types

    pub fn capture_types(&self) -> CaptureTypeSet {
        self.state.capture_types()
    }

    pub fn set_capture_types(&self, capture_types: CaptureTypeSet) {
        self.state.set_capture_types(capture_types);
    }

    pub fn enable_capture_types(&self, capture_types: &CaptureTypeSet) {
        self.state.enable_capture_types(capture_types);
    }

    pub fn disable_capture_types(&self, capture_types: &CaptureTypeSet) {
        self.state.disable_capture_types(capture_types);
    }

    // Blocklist

    pub fn blocklist(&self) -> Vec<BlocklistEntry> {
        self.state.blocklist.entries().as_ref().clone()
    }

    pub fn blocklist_request(&self, url_pattern: &str, status_code: u16, method_pattern: Option<&str>) -> Result<()> {
        let entry = match method_pattern {
            Some(method) => BlocklistEntry::with_method(url_pattern, status_code, method)?,
            None => BlocklistEntry::new(url_pattern, status_code)?,
        };
        self.state.blocklist.add(entry);
        Ok(())
    }

    pub fn set_blocklist(&self, entries: Vec<BlocklistEntry>) {
        self.state.blocklist.set_entries(entries);
    }

    pub fn remove_from_blocklist(&self, url_pattern: &str) -> bool {
        self.state.blocklist.remove(url_pattern)
    }

    pub fn clear_blocklist(&self) {
        self.state.blocklist.clear();
    }

    // Allowlist

    pub fn allowlist_urls(&self) -> Vec<String> {
        self.state
            .allowlist
            .snapshot()
            .patterns()
            .map(str::to_string)
            .collect()
    }

    pub fn allowlist_status(&self) -> u16 {
        self.state.allowlist.snapshot().status_code()
    }

    pub fn is_allowlist_enabled(&self) -> bool {
        self.state.allowlist.snapshot().is_enabled()
    }

    pub fn enable_allowlist(&self, patterns: &[String], status_code: u16) -> Result<()> {
        self.state.allowlist.enable(patterns, status_code)
    }

    pub fn add_allowlist_pattern(&self, pattern: &str) -> Result<()> {
        self.state.allowlist.add_pattern(pattern)
    }

    pub fn set_allowlist_patterns(&self, patterns: &[String]) -> Result<()> {
        self.state.allowlist.set_patterns(patterns)
    }

    pub fn clear_allowlist(&self) {
        self.state.allowlist.clear();
    }

    pub fn disable_allowlist(&self) {
        self.state.allowlist.disable();
    }

    // Rewrite rules

    pub fn rewrite_rules(&self) -> Vec<RewriteRule> {
        self.state.rewrites.rules().as_ref().clone()
    }

    pub fn rewrite_url(&self, pattern: &str, replacement: &str) -> Result<()> {
        self.state.rewrites.add(pattern, replacement)
    }

    pub fn set_rewrite_rules(&self, rules: Vec<RewriteRule>) {
        self.state.rewrites.set_rules(rules);
    }

    pub fn remove_rewrite_rule(&self, pattern: &str) -> bool {
        self.state.rewrites.remove(pattern)
    }

    pub fn clear_rewrite_rules(&self) {
        self.state.rewrites.clear();
    }

    // Additional headers

    pub fn additional_headers(&self) -> BTreeMap<String, String> {
        self.state.headers.headers()
    }

    pub fn add_header(&self, name: &str, value: &str) -> Result<()> {
        self.state.headers.add(name, value)
    }

    pub fn set_headers(&self, headers: BTreeMap<String, String>) -> Result<()> {
        self.state.headers.set_all(headers)
    }

    pub fn remove_header(&self, name: &str) -> bool {
        self.state.headers.remove(name)
    }

    pub fn clear_headers(&self) {
        self.state.headers.clear();
    }

    // Auto-authentication

    pub fn auto_authorization(&self, domain: &str, username: &str, password: &str) {
        self.state.auto_auth.add(domain, username, password);
    }

    pub fn stop_auto_authorization(&self, domain: &str) -> bool {
        self.state.auto_auth.remove(domain)
    }

    pub fn clear_auto_authorization(&self) {
        self.state.auto_auth.clear();
    }

    pub fn auto_authorized_domains(&self) -> Vec<String> {
        self.state.auto_auth.domains()
    }

    // Chained proxy

    /// Route upstream traffic through `upstream`, or directly with `None`.
    ///
    /// A running proxy without MITM cannot route its tunnels, so it refuses one.
    pub fn set_chained_proxy(&self, upstream: Option<UpstreamProxy>) -> Result<()> {
        if upstream.is_some() && self.started.load(Ordering::Acquire) && !self.is_mitm() {
            return Err(Error::state(
                "A chained proxy requires MITM; HTTPS tunnels would bypass it",
            ));
        }
        self.state.router.set_upstream(upstream);
        Ok(())
    }

    pub fn chained_proxy(&self) -> Option<Arc<UpstreamProxy>> {
        self.state.router.upstream()
    }

    pub fn set_chained_proxy_non_proxy_hosts(&self, hosts: &[String]) -> Result<()> {
        self.state.router.set_non_proxy_hosts(hosts)
    }

    pub fn chained_proxy_non_proxy_hosts(&self) -> Vec<String> {
        self.state.router.non_proxy_hosts()
    }

    // Shaping and timeouts

    pub fn set_latency(&self, latency: Duration) {
        self.state.shaping.set_latency(latency);
    }

    pub fn latency(&self) -> Duration {
        self.state.shaping.latency()
    }

    pub fn set_read_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.state.shaping.bandwidth().set_read_limit(bytes_per_sec);
    }

    pub fn set_write_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.state.shaping.bandwidth().set_write_limit(bytes_per_sec);
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.state.timeouts.set_connect(timeout);
    }

    pub fn set_idle_connection_timeout(&self, timeout: Duration) {
        self.state.timeouts.set_idle(timeout);
    }

    // Interceptors

    pub fn add_first_interceptor(&self, factory: Arc<dyn InterceptorFactory>) {
        self.state.pipeline.add_first(factory);
    }

    pub fn add_last_interceptor(&self, factory: Arc<dyn InterceptorFactory>) {
        self.state.pipeline.add_last(factory);
    }

    // Activity

    pub async fn wait_for_quiescence(&self, quiet: Duration, timeout: Duration) -> bool {
        self.state.activity.wait_for_quiescence(quiet, timeout).await
    }

    // Assertions

    fn current_har(&self) -> Har {
        self.state
            .har
            .get_har(false)
            .map(|document| document.snapshot())
            .unwrap_or_else(|| Har::new(Creator::new("skua", env!("CARGO_PKG_VERSION"))))
    }

    pub fn find_most_recent_entry(&self, url_pattern: &str) -> Result<Option<Entry>> {
        let pattern = compile(url_pattern)?;
        Ok(assertions::find_most_recent_entry(&self.current_har(), &pattern).cloned())
    }

    pub fn find_entries(&self, url_pattern: &str) -> Result<Vec<Entry>> {
        let pattern = compile(url_pattern)?;
        Ok(assertions::find_entries(&self.current_har(), &pattern)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Check the most recent entry whose URL matches
    pub fn assert_most_recent(&self, url_pattern: &str, assertion: &Assertion) -> Result<AssertionResult> {
        let pattern = compile(url_pattern)?;
        Ok(assertions::assert_most_recent(&self.current_har(), &pattern, assertion))
    }

    /// Check every entry whose URL matches
    pub fn assert_all(&self, url_pattern: &str, assertion: &Assertion) -> Result<AssertionResult> {
        let pattern = compile(url_pattern)?;
        Ok(assertions::assert_all(&self.current_har(), &pattern, assertion))
    }
}

fn compile(url_pattern: &str) -> Result<UrlPattern> {
    UrlPattern::new(url_pattern).map_err(|e| Error::InvalidPattern(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server() -> ProxyServer {
        let config = ProxyConfig::default().with_port(0);
        ProxyServer::new(config, CertificateAuthority::generate().unwrap()).unwrap()
    }

    fn ephemeral() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = server();
        assert!(server.port().await.is_none());
        assert!(matches!(server.stop().await, Err(Error::State(_))));

        let addr = server.start_on(ephemeral()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.port().await, Some(addr.port()));
        assert!(matches!(server.start().await, Err(Error::State(_))));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(matches!(server.stop().await, Err(Error::State(_))));
        assert!(matches!(server.abort().await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_startup_settings_are_frozen() {
        let server = server();
        server.set_mitm(false).unwrap();
        assert!(!server.is_mitm());

        server.start_on(ephemeral()).await.unwrap();
        assert!(matches!(server.set_mitm(true), Err(Error::State(_))));
        assert!(matches!(server.set_trust_all_servers(true), Err(Error::State(_))));
        server.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_chained_proxy_requires_mitm() {
        let upstream = || UpstreamProxy::parse("127.0.0.1:3128").unwrap();

        let direct = server();
        direct.set_mitm(false).unwrap();
        direct.set_chained_proxy(Some(upstream())).unwrap();
        assert!(matches!(direct.start_on(ephemeral()).await, Err(Error::State(_))));
        assert!(!direct.is_running().await);

        direct.set_chained_proxy(None).unwrap();
        direct.start_on(ephemeral()).await.unwrap();
        assert!(matches!(
            direct.set_chained_proxy(Some(upstream())),
            Err(Error::State(_))
        ));
        assert!(direct.chained_proxy().is_none());
        direct.abort().await.unwrap();

        let intercepting = server();
        intercepting.start_on(ephemeral()).await.unwrap();
        intercepting.set_chained_proxy(Some(upstream())).unwrap();
        assert_eq!(intercepting.chained_proxy().unwrap().port(), 3128);
        intercepting.abort().await.unwrap();
    }

    #[test]
    fn test_config_seeds_state() {
        let config = ProxyConfig::default()
            .with_latency(Duration::from_millis(40))
            .with_additional_header("X-Test", "yes");
        let server = ProxyServer::new(config, CertificateAuthority::generate().unwrap()).unwrap();
        assert_eq!(server.latency(), Duration::from_millis(40));
        assert_eq!(server.additional_headers()["X-Test"], "yes");
    }

    #[test]
    fn test_assertions_without_har_pass_vacuously() {
        let server = server();
        let result = server
            .assert_most_recent(".*", &Assertion::StatusEquals(200))
            .unwrap();
        assert!(result.passed);
        assert!(matches!(server.find_entries("("), Err(Error::InvalidPattern(_))));
    }
}
