use crate::pipeline::{ExchangeContext, HookResult, InterceptError, Interceptor, InterceptorFactory};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderValue, Request, Response, header};
use hudsucker::Body;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Encode `username:password` for a `Basic` authorization header
pub fn basic_credentials(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

/// Per-domain Basic credentials injected into matching requests
#[derive(Debug, Default)]
pub struct AutoAuthenticator {
    credentials: RwLock<Arc<HashMap<String, String>>>,
}

impl AutoAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, domain: &str, username: &str, password: &str) {
        let encoded = basic_credentials(username, password);
        let mut guard = self.credentials.write();
        let mut next = guard.as_ref().clone();
        next.insert(domain.to_lowercase(), encoded);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, domain: &str) -> bool {
        let mut guard = self.credentials.write();
        let mut next = guard.as_ref().clone();
        let removed = next.remove(&domain.to_lowercase()).is_some();
        *guard = Arc::new(next);
        removed
    }

    pub fn clear(&self) {
        *self.credentials.write() = Arc::new(HashMap::new());
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.credentials.read().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Base64 credentials for a host, if configured
    pub fn credentials_for(&self, host: &str) -> Option<String> {
        self.credentials.read().get(&host.to_lowercase()).cloned()
    }
}

/// Sets `Authorization: Basic ...` on requests to configured domains
pub struct AutoAuthInterceptor {
    auth: Arc<AutoAuthenticator>,
}

impl AutoAuthInterceptor {
    pub fn factory(auth: Arc<AutoAuthenticator>) -> Arc<dyn InterceptorFactory> {
        Arc::new(AutoAuthFactory { auth })
    }
}

struct AutoAuthFactory {
    auth: Arc<AutoAuthenticator>,
}

impl InterceptorFactory for AutoAuthFactory {
    fn name(&self) -> &str {
        "auto-auth"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }
        Some(Box::new(AutoAuthInterceptor {
            auth: Arc::clone(&self.auth),
        }))
    }
}

#[async_trait]
impl Interceptor for AutoAuthInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        let Some(host) = req.uri().host() else {
            return Ok(None);
        };
        if let Some(credentials) = self.auth.credentials_for(host) {
            let value = HeaderValue::from_str(&format!("Basic {}", credentials))
                .map_err(|e| InterceptError::new(e.to_string()))?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials() {
        assert_eq!(basic_credentials("user", "pass"), "dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_injects_and_overwrites_authorization() {
        let auth = Arc::new(AutoAuthenticator::new());
        auth.add("Secure.Test", "user", "pass");
        let mut interceptor = AutoAuthInterceptor {
            auth: Arc::clone(&auth),
        };

        let mut req = Request::builder()
            .uri("http://secure.test/private")
            .header("authorization", "Bearer stale")
            .body(Body::empty())
            .unwrap();
        interceptor.on_request(&mut req).await.unwrap();
        assert_eq!(req.headers()["authorization"], "Basic dXNlcjpwYXNz");

        let mut other = Request::builder()
            .uri("http://public.test/")
            .body(Body::empty())
            .unwrap();
        interceptor.on_request(&mut other).await.unwrap();
        assert!(other.headers().get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_removed_domain_stops_injection() {
        let auth = Arc::new(AutoAuthenticator::new());
        auth.add("secure.test", "user", "pass");
        assert!(auth.remove("secure.test"));
        assert!(auth.domains().is_empty());

        let mut interceptor = AutoAuthInterceptor { auth };
        let mut req = Request::builder()
            .uri("http://secure.test/")
            .body(Body::empty())
            .unwrap();
        interceptor.on_request(&mut req).await.unwrap();
        assert!(req.headers().get("authorization").is_none());
    }
}
