//! Chained upstream proxy routing.
//!
//! The upstream address and the non-proxy host list can be swapped while the
//! proxy runs. Whether the upstream is spoken to over TLS is fixed when the
//! router is built and read by the connector for every new connection.

use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory};
use crate::policy::{SnapshotList, basic_credentials};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{HeaderValue, Request, Response, header};
use hudsucker::Body;
use parking_lot::RwLock;
use skua_core::filter::HostPattern;
use std::fmt;
use std::sync::Arc;

/// An upstream proxy this proxy forwards traffic through
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    host: String,
    port: u16,
    credentials: Option<String>,
}

impl UpstreamProxy {
    /// Parse `host:port`
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Upstream proxy '{}' is not host:port", address)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("Invalid upstream proxy port in '{}'", address)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("Upstream proxy '{}' has no host", address)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(basic_credentials(username, password));
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `Proxy-Authorization` value, when credentials are configured
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| format!("Basic {}", c))
    }
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("address", &self.address())
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How a connection to a host is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Upstream(Arc<UpstreamProxy>),
}

#[derive(Debug, Default)]
pub struct ChainedProxyRouter {
    upstream: RwLock<Option<Arc<UpstreamProxy>>>,
    non_proxy_hosts: SnapshotList<HostPattern>,
    use_tls: bool,
}

impl ChainedProxyRouter {
    pub fn new(use_tls: bool) -> Self {
        Self {
            use_tls,
            ..Self::default()
        }
    }

    pub fn set_upstream(&self, upstream: Option<UpstreamProxy>) {
        match &upstream {
            Some(proxy) => tracing::info!("Routing traffic through upstream proxy {}", proxy.address()),
            None => tracing::info!("Upstream proxy cleared; connecting directly"),
        }
        *self.upstream.write() = upstream.map(Arc::new);
    }

    pub fn upstream(&self) -> Option<Arc<UpstreamProxy>> {
        self.upstream.read().clone()
    }

    /// Whether the upstream proxy is spoken to over TLS
    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn set_non_proxy_hosts(&self, hosts: &[String]) -> Result<()> {
        let patterns = hosts
            .iter()
            .map(|h| HostPattern::parse(h))
            .collect::<skua_core::Result<Vec<_>>>()?;
        self.non_proxy_hosts.replace(patterns);
        Ok(())
    }

    pub fn add_non_proxy_host(&self, host: &str) -> Result<()> {
        let pattern = HostPattern::parse(host)?;
        self.non_proxy_hosts.update(|list| list.push(pattern));
        Ok(())
    }

    pub fn non_proxy_hosts(&self) -> Vec<String> {
        self.non_proxy_hosts
            .snapshot()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }

    pub fn route_for(&self, host: &str) -> Route {
        let Some(upstream) = self.upstream() else {
            return Route::Direct;
        };
        if self.non_proxy_hosts.snapshot().iter().any(|p| p.matches(host)) {
            tracing::debug!("{} is a non-proxy host; connecting directly", host);
            return Route::Direct;
        }
        Route::Upstream(upstream)
    }
}

/// Adds `Proxy-Authorization` to plain HTTP requests forwarded to the upstream
/// in absolute form. Tunnelled requests authenticate on the CONNECT instead.
pub struct ProxyAuthInterceptor {
    router: Arc<ChainedProxyRouter>,
}

impl ProxyAuthInterceptor {
    pub fn factory(router: Arc<ChainedProxyRouter>) -> Arc<dyn InterceptorFactory> {
        Arc::new(ProxyAuthFactory { router })
    }
}

struct ProxyAuthFactory {
    router: Arc<ChainedProxyRouter>,
}

impl InterceptorFactory for ProxyAuthFactory {
    fn name(&self) -> &str {
        "proxy-auth"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_https() || self.router.upstream().is_none() {
            return None;
        }
        Some(Box::new(ProxyAuthInterceptor {
            router: Arc::clone(&self.router),
        }))
    }
}

#[async_trait]
impl Interceptor for ProxyAuthInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        // Rewriting may have moved the request; route on the final host
        let Some(host) = req.uri().host() else {
            return Ok(None);
        };
        if let Route::Upstream(upstream) = self.router.route_for(host)
            && let Some(authorization) = upstream.authorization()
        {
            let value = HeaderValue::from_str(&authorization)
                .map_err(|e| crate::pipeline::InterceptError::new(e.to_string()))?;
            req.headers_mut().insert(header::PROXY_AUTHORIZATION, value);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream() {
        let upstream = UpstreamProxy::parse("proxy.corp:3128").unwrap();
        assert_eq!(upstream.host(), "proxy.corp");
        assert_eq!(upstream.port(), 3128);
        assert!(upstream.authorization().is_none());

        let v6 = UpstreamProxy::parse("[::1]:8080").unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.address(), "[::1]:8080");

        assert!(UpstreamProxy::parse("proxy.corp").is_err());
        assert!(UpstreamProxy::parse("proxy.corp:http").is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let upstream = UpstreamProxy::parse("proxy:1").unwrap().with_credentials("u", "p");
        assert_eq!(upstream.authorization().as_deref(), Some("Basic dTpw"));
        assert!(!format!("{:?}", upstream).contains("dTpw"));
    }

    #[test]
    fn test_route_for_non_proxy_hosts() {
        let router = ChainedProxyRouter::new(false);
        assert_eq!(router.route_for("example.com"), Route::Direct);

        router.set_upstream(Some(UpstreamProxy::parse("proxy:3128").unwrap()));
        router
            .set_non_proxy_hosts(&["*.internal".to_string(), "localhost".to_string()])
            .unwrap();

        assert!(matches!(router.route_for("example.com"), Route::Upstream(_)));
        assert_eq!(router.route_for("db.internal"), Route::Direct);
        assert_eq!(router.route_for("LOCALHOST"), Route::Direct);
        // `.` is literal
        assert!(matches!(router.route_for("dbXinternal"), Route::Upstream(_)));

        router.set_upstream(None);
        assert_eq!(router.route_for("example.com"), Route::Direct);
    }

    #[tokio::test]
    async fn test_proxy_authorization_on_plain_http() {
        let router = Arc::new(ChainedProxyRouter::new(false));
        router.set_upstream(Some(
            UpstreamProxy::parse("proxy:3128").unwrap().with_credentials("u", "p"),
        ));
        router.add_non_proxy_host("direct.test").unwrap();
        let factory = ProxyAuthInterceptor::factory(Arc::clone(&router));

        let mut req = Request::builder()
            .uri("http://example.com/")
            .body(Body::empty())
            .unwrap();
        let mut interceptor = factory
            .new_instance(&ExchangeContext::from_request(None, &req))
            .unwrap();
        interceptor.on_request(&mut req).await.unwrap();
        assert_eq!(req.headers()["proxy-authorization"], "Basic dTpw");

        let mut direct = Request::builder()
            .uri("http://direct.test/")
            .body(Body::empty())
            .unwrap();
        interceptor.on_request(&mut direct).await.unwrap();
        assert!(direct.headers().get("proxy-authorization").is_none());

        let https = Request::builder()
            .uri("https://example.com/")
            .body(Body::empty())
            .unwrap();
        assert!(
            factory
                .new_instance(&ExchangeContext::from_request(None, &https))
                .is_none()
        );
    }
}
