//! Interception proxy that records HTTP/HTTPS traffic as HAR.
//!
//! Every exchange runs through an ordered [`Pipeline`] of interceptors. The
//! built-in ones record the exchange into the current HAR and apply the
//! configured traffic policies; embedders can register their own.

pub mod activity;
pub mod cert;
pub mod config;
pub mod error;
pub mod events;
pub mod har;
pub mod handler;
pub mod pipeline;
pub mod policy;
pub mod router;
pub mod server;
pub mod state;
pub mod transport;

pub use activity::ActivityMonitor;
pub use cert::CertificateAuthority;
pub use config::{ChainedProxyConfig, ProxyConfig};
pub use error::{Error, Result};
pub use events::{ExchangeEvents, ExchangeListener};
pub use har::{CaptureDocument, HarManager};
pub use handler::InterceptingHandler;
pub use pipeline::{
    ExchangeContext, FnFactory, HookResult, InterceptError, Interceptor, InterceptorFactory, Pipeline,
};
pub use router::{ChainedProxyRouter, UpstreamProxy};
pub use server::ProxyServer;
pub use state::ProxyState;
