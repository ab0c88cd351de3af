use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{HeaderName, HeaderValue, Request, Response};
use hudsucker::Body;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct HeaderSet {
    raw: BTreeMap<String, String>,
    parsed: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderSet {
    fn from_map(raw: BTreeMap<String, String>) -> Result<Self> {
        let parsed = raw
            .iter()
            .map(|(name, value)| parse_header(name, value))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { raw, parsed })
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid header name '{}': {}", name, e)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("Invalid value for header '{}': {}", name, e)))?;
    Ok((header_name, header_value))
}

/// Headers set on every outgoing request, overwriting any existing value
#[derive(Debug, Default)]
pub struct AdditionalHeaders {
    current: RwLock<Arc<HeaderSet>>,
}

impl AdditionalHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole map at once
    pub fn set_all(&self, headers: BTreeMap<String, String>) -> Result<()> {
        let next = HeaderSet::from_map(headers)?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    pub fn add(&self, name: &str, value: &str) -> Result<()> {
        parse_header(name, value)?;
        let mut guard = self.current.write();
        let mut raw = guard.raw.clone();
        raw.insert(name.to_string(), value.to_string());
        *guard = Arc::new(HeaderSet::from_map(raw)?);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.current.write();
        let mut raw = guard.raw.clone();
        let before = raw.len();
        raw.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        if raw.len() == before {
            return false;
        }
        // Every remaining pair was already validated
        let parsed = guard
            .parsed
            .iter()
            .filter(|(n, _)| !n.as_str().eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        *guard = Arc::new(HeaderSet { raw, parsed });
        true
    }

    pub fn clear(&self) {
        *self.current.write() = Arc::new(HeaderSet::default());
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.current.read().raw.clone()
    }

    fn parsed(&self) -> Arc<HeaderSet> {
        Arc::clone(&self.current.read())
    }
}

/// Applies [`AdditionalHeaders`] to the request
pub struct AdditionalHeadersInterceptor {
    headers: Arc<AdditionalHeaders>,
}

impl AdditionalHeadersInterceptor {
    pub fn factory(headers: Arc<AdditionalHeaders>) -> Arc<dyn InterceptorFactory> {
        Arc::new(AdditionalHeadersFactory { headers })
    }
}

struct AdditionalHeadersFactory {
    headers: Arc<AdditionalHeaders>,
}

impl InterceptorFactory for AdditionalHeadersFactory {
    fn name(&self) -> &str {
        "additional-headers"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }
        Some(Box::new(AdditionalHeadersInterceptor {
            headers: Arc::clone(&self.headers),
        }))
    }
}

#[async_trait]
impl Interceptor for AdditionalHeadersInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        let set = self.headers.parsed();
        for (name, value) in &set.parsed {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(None)
    }
}
