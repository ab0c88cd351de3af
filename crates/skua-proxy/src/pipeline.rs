//! The ordered interceptor chain every exchange passes through.
//!
//! The pipeline holds factories, not interceptors. Each exchange gets a fresh
//! instance from every factory, so no mutable state is shared between
//! exchanges. Request hooks run in registration order and the first one that
//! produces a response short-circuits the exchange; response hooks then run,
//! in the same order, for the instances whose request hook was invoked.

use crate::events::{ExchangeEvents, ExchangeListener};
use crate::policy::SnapshotList;
use async_trait::async_trait;
use futures::FutureExt;
use http::{Method, Request, Response, Uri, Version};
use hudsucker::Body;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A failed hook; the pipeline logs it and carries on
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct InterceptError(String);

impl InterceptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for InterceptError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for InterceptError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HookResult<T> = std::result::Result<T, InterceptError>;

/// What factories know about an exchange before any hook has run
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub client_addr: Option<SocketAddr>,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
}

impl ExchangeContext {
    pub fn new(client_addr: Option<SocketAddr>, method: Method, uri: Uri) -> Self {
        Self {
            client_addr,
            method,
            uri,
            version: Version::HTTP_11,
        }
    }

    pub fn from_request(client_addr: Option<SocketAddr>, req: &Request<Body>) -> Self {
        Self {
            version: req.version(),
            ..Self::new(client_addr, req.method().clone(), req.uri().clone())
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn is_https(&self) -> bool {
        self.is_connect() || self.uri.scheme_str() == Some("https")
    }

    pub fn host(&self) -> Option<&str> {
        self.uri.host()
    }

    /// The URL policies match against; CONNECT targets are rendered as `https://host:port`
    pub fn url(&self) -> String {
        request_url(&self.method, &self.uri)
    }
}

pub(crate) fn request_url(method: &Method, uri: &Uri) -> String {
    if method == Method::CONNECT {
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| uri.to_string());
        format!("https://{}", authority)
    } else {
        uri.to_string()
    }
}

/// Per-exchange interceptor instance. Never reused across exchanges.
#[async_trait]
pub trait Interceptor: Send {
    /// Inspect or modify the request. Returning a response short-circuits the exchange.
    async fn on_request(&mut self, _req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        Ok(None)
    }

    async fn on_response(&mut self, _res: &mut Response<Body>) -> HookResult<()> {
        Ok(())
    }

    /// Transport callbacks this instance wants to receive
    fn listener(&self) -> Option<Arc<dyn ExchangeListener>> {
        None
    }
}

/// Produces one interceptor instance per exchange
pub trait InterceptorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// `None` opts this factory out of the exchange
    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>>;
}

/// Adapts a closure into an [`InterceptorFactory`]
pub struct FnFactory<F> {
    name: String,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&ExchangeContext) -> Option<Box<dyn Interceptor>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            build,
        }
    }
}

impl<F> InterceptorFactory for FnFactory<F>
where
    F: Fn(&ExchangeContext) -> Option<Box<dyn Interceptor>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        (self.build)(ctx)
    }
}

/// The ordered factory list. Safe to modify while exchanges are in flight;
/// exchanges already started keep the order they began with.
#[derive(Default)]
pub struct Pipeline {
    factories: SnapshotList<Arc<dyn InterceptorFactory>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factories(factories: Vec<Arc<dyn InterceptorFactory>>) -> Self {
        Self {
            factories: SnapshotList::new(factories),
        }
    }

    pub fn add_first(&self, factory: Arc<dyn InterceptorFactory>) {
        tracing::debug!("Registering interceptor '{}' first", factory.name());
        self.factories.update(|list| list.insert(0, factory));
    }

    pub fn add_last(&self, factory: Arc<dyn InterceptorFactory>) {
        tracing::debug!("Registering interceptor '{}' last", factory.name());
        self.factories.update(|list| list.push(factory));
    }

    /// Registered factory names, in invocation order
    pub fn names(&self) -> Vec<String> {
        self.factories
            .snapshot()
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Instantiate the interceptors for a new exchange
    pub fn begin(&self, ctx: &ExchangeContext) -> Exchange {
        let factories = self.factories.snapshot();
        let mut instances = Vec::with_capacity(factories.len());

        for factory in factories.iter() {
            let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory.new_instance(ctx)));
            match built {
                Ok(Some(instance)) => instances.push(Stage {
                    name: factory.name().to_string(),
                    interceptor: instance,
                }),
                Ok(None) => {}
                Err(_) => tracing::warn!(
                    "Interceptor factory '{}' panicked; skipping it for {}",
                    factory.name(),
                    ctx.uri
                ),
            }
        }

        let listeners = instances
            .iter()
            .filter_map(|stage| stage.interceptor.listener())
            .collect();

        Exchange {
            instances,
            invoked: 0,
            events: ExchangeEvents::new(listeners),
        }
    }
}

struct Stage {
    name: String,
    interceptor: Box<dyn Interceptor>,
}

/// The interceptor instances of one exchange
pub struct Exchange {
    instances: Vec<Stage>,
    invoked: usize,
    events: ExchangeEvents,
}

impl Exchange {
    /// Run request hooks in order until one short-circuits
    pub async fn on_request(&mut self, req: &mut Request<Body>) -> Option<Response<Body>> {
        for (index, stage) in self.instances.iter_mut().enumerate() {
            self.invoked = index + 1;

            let outcome = AssertUnwindSafe(stage.interceptor.on_request(req))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(Some(response))) => {
                    tracing::debug!(
                        "Interceptor '{}' short-circuited {} with {}",
                        stage.name,
                        req.uri(),
                        response.status()
                    );
                    return Some(response);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Request hook of '{}' failed: {}", stage.name, e);
                }
                Err(_) => {
                    tracing::warn!("Request hook of '{}' panicked", stage.name);
                }
            }
        }
        None
    }

    /// Run response hooks, in request order, for every instance whose request hook ran
    pub async fn on_response(&mut self, res: &mut Response<Body>) {
        for stage in self.instances.iter_mut().take(self.invoked) {
            let outcome = AssertUnwindSafe(stage.interceptor.on_response(res))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Response hook of '{}' failed: {}", stage.name, e);
                }
                Err(_) => {
                    tracing::warn!("Response hook of '{}' panicked", stage.name);
                }
            }
        }
    }

    /// Transport callbacks fan out to every listening instance
    pub fn events(&self) -> ExchangeEvents {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
