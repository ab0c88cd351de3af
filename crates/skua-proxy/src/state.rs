//! Shared state of one proxy instance.
//!
//! Everything an exchange reads lives here as a named field, shared by `Arc`
//! with the interceptors that need it. Policy lists are copy-on-write; the
//! HAR document and page are guarded by the [`HarManager`]'s own lock.

use crate::activity::{ActivityFactory, ActivityMonitor};
use crate::har::{HarCaptureFactory, HarManager};
use crate::pipeline::Pipeline;
use crate::policy::{
    AdditionalHeaders, AdditionalHeadersInterceptor, Allowlist, AllowlistInterceptor,
    AutoAuthInterceptor, AutoAuthenticator, Blocklist, BlocklistInterceptor, LatencyInterceptor,
    RewriteInterceptor, RewriteRules, TrafficShaping,
};
use crate::router::{ChainedProxyRouter, ProxyAuthInterceptor};
use crate::transport::Timeouts;
use parking_lot::RwLock;
use skua_core::CaptureTypeSet;
use skua_core::har::Creator;
use std::sync::Arc;

pub struct ProxyState {
    pub har: Arc<HarManager>,
    pub capture_types: Arc<RwLock<CaptureTypeSet>>,
    pub blocklist: Arc<Blocklist>,
    pub allowlist: Arc<Allowlist>,
    pub rewrites: Arc<RewriteRules>,
    pub auto_auth: Arc<AutoAuthenticator>,
    pub headers: Arc<AdditionalHeaders>,
    pub shaping: Arc<TrafficShaping>,
    pub router: Arc<ChainedProxyRouter>,
    pub activity: Arc<ActivityMonitor>,
    pub timeouts: Arc<Timeouts>,
    pub pipeline: Pipeline,
}

impl ProxyState {
    pub fn new(router: ChainedProxyRouter, timeouts: Timeouts, capture_types: CaptureTypeSet) -> Self {
        let har = Arc::new(HarManager::new(Creator::new(
            "skua",
            env!("CARGO_PKG_VERSION"),
        )));
        let capture_types = Arc::new(RwLock::new(capture_types));
        let blocklist = Arc::new(Blocklist::new());
        let allowlist = Arc::new(Allowlist::new());
        let rewrites = Arc::new(RewriteRules::new());
        let auto_auth = Arc::new(AutoAuthenticator::new());
        let headers = Arc::new(AdditionalHeaders::new());
        let shaping = Arc::new(TrafficShaping::new());
        let router = Arc::new(router);
        let activity = Arc::new(ActivityMonitor::new());

        // Fixed bootstrap order. Capture sits before the policies that can
        // short-circuit, so rejected requests are still recorded.
        let pipeline = Pipeline::with_factories(vec![
            ActivityFactory::new(Arc::clone(&activity)),
            RewriteInterceptor::factory(Arc::clone(&rewrites)),
            HarCaptureFactory::new(Arc::clone(&har), Arc::clone(&capture_types)),
            BlocklistInterceptor::factory(Arc::clone(&blocklist)),
            AllowlistInterceptor::factory(Arc::clone(&allowlist)),
            AutoAuthInterceptor::factory(Arc::clone(&auto_auth)),
            AdditionalHeadersInterceptor::factory(Arc::clone(&headers)),
            ProxyAuthInterceptor::factory(Arc::clone(&router)),
            LatencyInterceptor::factory(Arc::clone(&shaping)),
        ]);

        Self {
            har,
            capture_types,
            blocklist,
            allowlist,
            rewrites,
            auto_auth,
            headers,
            shaping,
            router,
            activity,
            timeouts: Arc::new(timeouts),
            pipeline,
        }
    }

    pub fn capture_types(&self) -> CaptureTypeSet {
        self.capture_types.read().clone()
    }

    pub fn set_capture_types(&self, capture_types: CaptureTypeSet) {
        *self.capture_types.write() = capture_types;
    }

    pub fn enable_capture_types(&self, capture_types: &CaptureTypeSet) {
        self.capture_types.write().enable(capture_types);
    }

    pub fn disable_capture_types(&self, capture_types: &CaptureTypeSet) {
        self.capture_types.write().disable(capture_types);
    }
}

impl Default for ProxyState {
    fn default() -> Self {
        Self::new(ChainedProxyRouter::default(), Timeouts::default(), CaptureTypeSet::none())
    }
}
