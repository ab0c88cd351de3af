use super::SnapshotList;
use crate::pipeline::{ExchangeContext, HookResult, InterceptError, Interceptor, InterceptorFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use http::uri::{Parts, Uri};
use http::{HeaderValue, Request, Response, header};
use hudsucker::Body;
use regex::Regex;
use std::sync::Arc;

/// The URL a request carried when it reached the proxy, before any rewriting.
/// Stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalUrl(pub String);

/// Replaces every match of `pattern` in the URL; `$1`-style group references are expanded
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            Error::InvalidPattern(format!("Invalid rewrite pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            pattern,
            replacement: replacement.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn apply(&self, url: &str) -> Option<String> {
        if !self.pattern.is_match(url) {
            return None;
        }
        Some(
            self.pattern
                .replace_all(url, self.replacement.as_str())
                .into_owned(),
        )
    }
}

/// Ordered rewrite rules, each applied to the output of the previous one
#[derive(Debug, Default)]
pub struct RewriteRules {
    rules: SnapshotList<RewriteRule>,
}

impl RewriteRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pattern: &str, replacement: &str) -> Result<()> {
        let rule = RewriteRule::new(pattern, replacement)?;
        self.rules.update(|rules| rules.push(rule));
        Ok(())
    }

    pub fn set_rules(&self, rules: Vec<RewriteRule>) {
        self.rules.replace(rules);
    }

    pub fn remove(&self, pattern: &str) -> bool {
        self.rules.update(|rules| {
            let before = rules.len();
            rules.retain(|r| r.pattern() != pattern);
            rules.len() != before
        })
    }

    pub fn clear(&self) {
        self.rules.replace(Vec::new());
    }

    pub fn rules(&self) -> Arc<Vec<RewriteRule>> {
        self.rules.snapshot()
    }

    /// Run every rule in order; `None` when the URL is unchanged
    pub fn rewrite(&self, url: &str) -> Option<String> {
        let rules = self.rules.snapshot();
        let mut current = url.to_string();
        for rule in rules.iter() {
            if let Some(next) = rule.apply(&current) {
                current = next;
            }
        }
        (current != url).then_some(current)
    }
}

/// Applies the rewrite rules to the request URI
pub struct RewriteInterceptor {
    rules: Arc<RewriteRules>,
}

impl RewriteInterceptor {
    pub fn factory(rules: Arc<RewriteRules>) -> Arc<dyn InterceptorFactory> {
        Arc::new(RewriteFactory { rules })
    }
}

struct RewriteFactory {
    rules: Arc<RewriteRules>,
}

impl InterceptorFactory for RewriteFactory {
    fn name(&self) -> &str {
        "rewrite"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }
        Some(Box::new(RewriteInterceptor {
            rules: Arc::clone(&self.rules),
        }))
    }
}

#[async_trait]
impl Interceptor for RewriteInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        let original = req.uri().to_string();
        let Some(rewritten) = self.rules.rewrite(&original) else {
            return Ok(None);
        };

        let target: Uri = rewritten.parse().map_err(|e| {
            InterceptError::new(format!("Rewritten URL '{}' is invalid: {}", rewritten, e))
        })?;

        let uri = if req.uri().scheme_str() == Some("https") {
            // The tunnel is bound to the original host, only path and query can change
            if target.scheme() != req.uri().scheme() || target.authority() != req.uri().authority() {
                tracing::warn!(
                    "Ignoring host change in rewrite of HTTPS URL {} -> {}",
                    original,
                    rewritten
                );
            }
            let mut parts = Parts::default();
            parts.scheme = req.uri().scheme().cloned();
            parts.authority = req.uri().authority().cloned();
            parts.path_and_query = target.path_and_query().cloned();
            Uri::from_parts(parts)
                .map_err(|e| InterceptError::new(format!("Cannot rebuild URI: {}", e)))?
        } else {
            if target.authority() != req.uri().authority() {
                if let Some(authority) = target.authority() {
                    let host = HeaderValue::from_str(authority.as_str())
                        .map_err(|e| InterceptError::new(e.to_string()))?;
                    req.headers_mut().insert(header::HOST, host);
                }
            }
            target
        };

        tracing::debug!("Rewrote {} -> {}", original, uri);
        req.extensions_mut().insert(OriginalUrl(original));
        *req.uri_mut() = uri;
        Ok(None)
    }
}
