use super::{SnapshotList, status_code, status_response};
use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory, request_url};
use crate::{Error, Result};
use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use hudsucker::Body;
use skua_core::filter::UrlPattern;
use std::sync::Arc;

/// A URL (and optionally method) pattern answered with a fixed status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistEntry {
    url: UrlPattern,
    status: StatusCode,
    method: Option<UrlPattern>,
}

impl BlocklistEntry {
    /// Block every method except CONNECT
    pub fn new(url_pattern: &str, code: u16) -> Result<Self> {
        Ok(Self {
            url: compile(url_pattern)?,
            status: status_code(code)?,
            method: None,
        })
    }

    /// Block only methods matching `method_pattern`
    pub fn with_method(url_pattern: &str, code: u16, method_pattern: &str) -> Result<Self> {
        Ok(Self {
            url: compile(url_pattern)?,
            status: status_code(code)?,
            method: Some(compile(method_pattern)?),
        })
    }

    pub fn url_pattern(&self) -> &str {
        self.url.as_str()
    }

    pub fn method_pattern(&self) -> Option<&str> {
        self.method.as_ref().map(UrlPattern::as_str)
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// CONNECT only matches entries whose method pattern names it explicitly
    pub fn matches(&self, url: &str, method: &Method) -> bool {
        let method_matches = match &self.method {
            Some(pattern) => pattern.matches(method.as_str()),
            None => *method != Method::CONNECT,
        };
        method_matches && self.url.matches(url)
    }
}

fn compile(pattern: &str) -> Result<UrlPattern> {
    UrlPattern::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))
}

/// Ordered blocklist; the first matching entry wins
#[derive(Debug, Default)]
pub struct Blocklist {
    entries: SnapshotList<BlocklistEntry>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: BlocklistEntry) {
        self.entries.update(|entries| entries.push(entry));
    }

    pub fn set_entries(&self, entries: Vec<BlocklistEntry>) {
        self.entries.replace(entries);
    }

    /// Remove every entry with the given URL pattern, returning whether any existed
    pub fn remove(&self, url_pattern: &str) -> bool {
        self.entries.update(|entries| {
            let before = entries.len();
            entries.retain(|e| e.url_pattern() != url_pattern);
            entries.len() != before
        })
    }

    pub fn clear(&self) {
        self.entries.replace(Vec::new());
    }

    pub fn entries(&self) -> Arc<Vec<BlocklistEntry>> {
        self.entries.snapshot()
    }

    pub fn find_match(&self, url: &str, method: &Method) -> Option<BlocklistEntry> {
        self.entries
            .snapshot()
            .iter()
            .find(|entry| entry.matches(url, method))
            .cloned()
    }
}

/// Short-circuits blocklisted requests with the entry's status and an empty body
pub struct BlocklistInterceptor {
    blocklist: Arc<Blocklist>,
}

impl BlocklistInterceptor {
    pub fn factory(blocklist: Arc<Blocklist>) -> Arc<dyn InterceptorFactory> {
        Arc::new(BlocklistFactory { blocklist })
    }
}

struct BlocklistFactory {
    blocklist: Arc<Blocklist>,
}

impl InterceptorFactory for BlocklistFactory {
    fn name(&self) -> &str {
        "blocklist"
    }

    fn new_instance(&self, _ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        Some(Box::new(BlocklistInterceptor {
            blocklist: Arc::clone(&self.blocklist),
        }))
    }
}

#[async_trait]
impl Interceptor for BlocklistInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        let url = request_url(req.method(), req.uri());
        Ok(self.blocklist.find_match(&url, req.method()).map(|entry| {
            tracing::debug!("Blocklisted {} {} -> {}", req.method(), url, entry.status);
            status_response(entry.status)
        }))
    }
}
