//! Per-exchange HAR recorder.
//!
//! The entry is appended to the document as soon as the exchange begins, with
//! a placeholder response, and is then filled in place as the request, the
//! transport callbacks and the response arrive. Timing fields are always
//! recomputed from the monotonic stamps collected so far, so callbacks that
//! are missing or arrive late never leave the entry inconsistent.

use super::content::{self, CapturedText};
use super::log::{HarManager, now_iso8601};
use crate::events::ExchangeListener;
use crate::pipeline::{ExchangeContext, HookResult, Interceptor, InterceptorFactory};
use crate::policy::OriginalUrl;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap};
use http::{Request, Response};
use http_body::Body as _;
use http_body_util::{BodyExt, Full};
use hudsucker::Body;
use parking_lot::{Mutex, RwLock};
use skua_core::har::{self as model, Entry, PostData, Timings};
use skua_core::{CaptureType, CaptureTypeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Resolution,
    Connection,
    Timeout,
}

#[derive(Debug, Default)]
struct Phases {
    resolution_started: Option<Instant>,
    resolved: Option<Instant>,
    connection_queued: Option<Instant>,
    connection_started: Option<Instant>,
    ssl_started: Option<Instant>,
    ssl_succeeded: Option<Instant>,
    connected: Option<Instant>,
    sending: Option<Instant>,
    sent: Option<Instant>,
    receiving: Option<Instant>,
    received: Option<Instant>,
    failure: Option<(Failure, Instant)>,
    reused: bool,
    server_ip: Option<IpAddr>,
    request_bytes: i64,
    response_bytes: i64,
}

fn millis(from: Instant, to: Instant) -> i64 {
    to.saturating_duration_since(from).as_millis() as i64
}

/// Elapsed from `start` to `end`; `0` when the start was never observed
fn phase(start: Option<Instant>, end: Option<Instant>) -> Option<i64> {
    end.map(|end| start.map_or(0, |start| millis(start, end)))
}

impl Phases {
    fn failed(&self, kind: Failure) -> Option<Instant> {
        self.failure.filter(|(k, _)| *k == kind).map(|(_, at)| at)
    }

    fn timings(&self) -> Timings {
        let mut timings = Timings::default();

        if !self.reused {
            let dns_end = self.resolved.or(self.failed(Failure::Resolution));
            if let Some(dns) = phase(self.resolution_started, dns_end) {
                timings.dns = dns;
            }
            if let (Some(queued), Some(started)) = (self.connection_queued, self.connection_started) {
                timings.blocked = millis(queued, started);
            }
            let connect_failed = self.failed(Failure::Connection);
            if let Some(connect) = phase(self.connection_started, self.connected.or(connect_failed)) {
                timings.connect = connect;
            }
            if self.ssl_started.is_some()
                && let Some(ssl) = phase(self.ssl_started, self.ssl_succeeded.or(connect_failed))
            {
                timings.ssl = ssl;
            }
        }

        // Nothing goes out before the connection is up
        let sending = match (self.sending, self.connected) {
            (Some(sending), Some(connected)) => Some(sending.max(connected)),
            (sending, _) => sending,
        };
        let sent = match (self.sent, sending) {
            (Some(sent), Some(sending)) => Some(sent.max(sending)),
            (sent, _) => sent,
        };
        if let Some(send) = phase(sending, sent) {
            timings.send = send;
        }

        let timed_out = self.failed(Failure::Timeout);
        let first_byte = self.receiving.or(timed_out);
        if let Some(wait) = phase(sent, first_byte) {
            timings.wait = wait;
        }
        if self.receiving.is_some()
            && let Some(receive) = phase(self.receiving, self.received.or(timed_out))
        {
            timings.receive = receive;
        }

        timings
    }

    fn apply(&self, entry: &mut Entry) {
        entry.timings = self.timings();
        entry.time = entry.timings.total();
        if let Some(ip) = self.server_ip {
            entry.server_ip_address = Some(ip.to_string());
        }
        if self.sent.is_some() {
            entry.request.body_size = self.request_bytes;
        }
        if self.failure.is_none() && self.received.is_some() {
            entry.response.body_size = self.response_bytes;
        }
    }
}

/// Shared between the interceptor instance and the transport callbacks
pub(crate) struct HarRecorder {
    entry: Arc<Mutex<Entry>>,
    phases: Mutex<Phases>,
}

impl HarRecorder {
    pub(crate) fn new(entry: Arc<Mutex<Entry>>) -> Self {
        Self {
            entry,
            phases: Mutex::new(Phases::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Phases)) {
        let mut phases = self.phases.lock();
        f(&mut phases);
        phases.apply(&mut self.entry.lock());
    }

    fn stamp(&self, at: Instant, field: impl FnOnce(&mut Phases) -> &mut Option<Instant>) {
        self.update(|phases| {
            field(phases).get_or_insert(at);
        });
    }

    fn has_failed(&self) -> bool {
        self.phases.lock().failure.is_some()
    }

    fn fail(&self, at: Instant, kind: Failure, message: String) {
        tracing::debug!("Recording failed exchange: {}", message);
        let mut phases = self.phases.lock();
        if phases.failure.is_some() {
            return;
        }
        phases.failure = Some((kind, at));

        let mut entry = self.entry.lock();
        entry.response = model::Response::failure();
        entry.set_additional("_errorMessage", message);
        phases.apply(&mut entry);
    }
}

impl ExchangeListener for HarRecorder {
    fn resolution_started(&self, at: Instant) {
        self.stamp(at, |p| &mut p.resolution_started);
    }

    fn resolution_succeeded(&self, at: Instant, address: IpAddr) {
        self.update(|p| {
            p.resolved.get_or_insert(at);
            p.server_ip = Some(address);
        });
    }

    fn resolution_failed(&self, at: Instant, host: &str) {
        self.fail(at, Failure::Resolution, format!("Unable to resolve host {}", host));
    }

    fn connection_queued(&self, at: Instant) {
        self.stamp(at, |p| &mut p.connection_queued);
    }

    fn connection_started(&self, at: Instant) {
        self.stamp(at, |p| &mut p.connection_started);
    }

    fn ssl_started(&self, at: Instant) {
        self.stamp(at, |p| &mut p.ssl_started);
    }

    fn ssl_succeeded(&self, at: Instant) {
        self.stamp(at, |p| &mut p.ssl_succeeded);
    }

    fn connection_succeeded(&self, at: Instant) {
        self.stamp(at, |p| &mut p.connected);
    }

    fn connection_failed(&self, at: Instant, host: &str) {
        self.fail(at, Failure::Connection, format!("Unable to connect to host {}", host));
    }

    fn connection_reused(&self, _at: Instant) {
        self.update(|p| p.reused = true);
    }

    fn request_sending(&self, at: Instant) {
        self.stamp(at, |p| &mut p.sending);
    }

    fn request_body_chunk(&self, len: usize) {
        self.phases.lock().request_bytes += len as i64;
    }

    fn request_sent(&self, at: Instant) {
        self.stamp(at, |p| &mut p.sent);
    }

    fn response_receiving(&self, at: Instant) {
        self.stamp(at, |p| &mut p.receiving);
    }

    fn response_body_chunk(&self, len: usize) {
        self.phases.lock().response_bytes += len as i64;
    }

    fn response_received(&self, at: Instant) {
        self.stamp(at, |p| &mut p.received);
    }

    fn response_timed_out(&self, at: Instant) {
        self.fail(at, Failure::Timeout, "Response timed out".to_string());
    }
}

/// Registers the HAR recorder for every exchange
pub(crate) struct HarCaptureFactory {
    manager: Arc<HarManager>,
    capture: Arc<RwLock<CaptureTypeSet>>,
}

impl HarCaptureFactory {
    pub(crate) fn new(
        manager: Arc<HarManager>,
        capture: Arc<RwLock<CaptureTypeSet>>,
    ) -> Arc<dyn InterceptorFactory> {
        Arc::new(Self { manager, capture })
    }
}

impl InterceptorFactory for HarCaptureFactory {
    fn name(&self) -> &str {
        "har-capture"
    }

    fn new_instance(&self, ctx: &ExchangeContext) -> Option<Box<dyn Interceptor>> {
        if ctx.is_connect() {
            return None;
        }

        let request = model::Request::new(
            ctx.method.as_str(),
            ctx.url(),
            content::http_version(ctx.version),
        );
        let entry = self
            .manager
            .register(|page| Entry::new(Some(page.to_string()), now_iso8601(), request));

        Some(Box::new(HarCaptureInterceptor {
            recorder: Arc::new(HarRecorder::new(entry)),
            capture: self.capture.read().clone(),
        }))
    }
}

struct HarCaptureInterceptor {
    recorder: Arc<HarRecorder>,
    capture: CaptureTypeSet,
}

impl HarCaptureInterceptor {
    fn wants(&self, capture_type: CaptureType) -> bool {
        self.capture.contains(capture_type)
    }

    fn capture_request_head(&self, req: &Request<Body>) {
        let url = req.uri().to_string();
        let original = req
            .extensions()
            .get::<OriginalUrl>()
            .map(|o| o.0.clone())
            .unwrap_or_else(|| url.clone());
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut entry = self.recorder.entry.lock();
        entry.request.method = req.method().to_string();
        entry.request.http_version = content::http_version(req.version()).to_string();
        entry.request.headers_size =
            content::request_headers_size(req.method().as_str(), target, req.version(), req.headers());

        match content::query_params(&url) {
            Ok(params) => entry.request.query_string = params,
            Err(e) => {
                tracing::warn!("Unable to parse query string of {}: {}", url, e);
                entry.add_comment(&format!("Unable to parse query string: {}", e));
            }
        }
        if self.wants(CaptureType::RequestHeaders) {
            entry.request.headers = content::har_headers(req.headers());
        }
        if self.wants(CaptureType::RequestCookies) {
            entry.request.cookies = content::request_cookies(req.headers());
        }

        entry.request.url = url;
        entry.set_additional("_url", original);
    }

    async fn capture_request_body(&self, req: &mut Request<Body>) {
        let mime_type = content::mime_type(req.headers());
        let is_text = content::is_text(&mime_type);
        let wanted = if is_text {
            self.wants(CaptureType::RequestContent)
        } else {
            self.wants(CaptureType::RequestBinaryContent)
        };
        if !wanted || req.body().is_end_stream() {
            return;
        }

        let body = std::mem::replace(req.body_mut(), Body::empty());
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Unable to read request body of {}: {}", req.uri(), e);
                self.recorder
                    .entry
                    .lock()
                    .add_comment(&format!("Unable to read request body: {}", e));
                return;
            }
        };
        *req.body_mut() = Body::from(Full::new(bytes.clone()));

        let mut post_data = PostData {
            mime_type: mime_type.clone(),
            params: None,
            text: None,
            comment: None,
        };
        if content::is_form_urlencoded(&mime_type) {
            post_data.params = Some(content::form_params(&bytes));
        } else if is_text {
            match content::decode_body(&bytes, &mime_type) {
                CapturedText::Text(text) => post_data.text = Some(text),
                CapturedText::Base64(encoded) => {
                    post_data.text = Some(encoded);
                    post_data.comment = Some("base64".to_string());
                }
            }
        } else {
            post_data.text = Some(content::base64(&bytes));
            post_data.comment = Some("base64".to_string());
        }
        self.recorder.entry.lock().request.post_data = Some(post_data);
    }

    fn capture_response_head(&self, res: &Response<Body>) {
        let status = res.status();
        let mut entry = self.recorder.entry.lock();
        let response = &mut entry.response;

        response.status = i64::from(status.as_u16());
        response.status_text = status.canonical_reason().unwrap_or("").to_string();
        response.http_version = content::http_version(res.version()).to_string();
        response.headers_size = content::response_headers_size(res.version(), status, res.headers());
        response.content.mime_type = content::mime_type(res.headers());
        response.redirect_url = if status.is_redirection() {
            res.headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        } else {
            String::new()
        };
        if self.wants(CaptureType::ResponseHeaders) {
            response.headers = content::har_headers(res.headers());
        }
        if self.wants(CaptureType::ResponseCookies) {
            response.cookies = content::response_cookies(res.headers());
        }
    }

    async fn capture_response_body(&self, res: &mut Response<Body>) {
        let mime_type = content::mime_type(res.headers());
        let is_text = content::is_text(&mime_type);
        let wanted = if is_text {
            self.wants(CaptureType::ResponseContent)
        } else {
            self.wants(CaptureType::ResponseBinaryContent)
        };
        if !wanted {
            return;
        }

        let body = std::mem::replace(res.body_mut(), Body::empty());
        let raw = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Unable to read response body: {}", e);
                self.recorder
                    .entry
                    .lock()
                    .add_comment(&format!("Unable to read response body: {}", e));
                return;
            }
        };
        *res.body_mut() = Body::from(Full::new(raw.clone()));

        let (decoded, comment) = match decode_for_capture(res.headers(), raw.clone()).await {
            Ok(decoded) => (Some(decoded), None),
            Err(e) => {
                tracing::warn!("Unable to decode response body: {}", e);
                (None, Some(format!("Unable to decode response body: {}", e)))
            }
        };

        let mut entry = self.recorder.entry.lock();
        if let Some(comment) = &comment {
            entry.add_comment(comment);
        }
        let captured = match &decoded {
            Some(decoded) if is_text => content::decode_body(decoded, &mime_type),
            Some(decoded) => CapturedText::Base64(content::base64(decoded)),
            None => CapturedText::Base64(content::base64(&raw)),
        };

        let content = &mut entry.response.content;
        let size = decoded.as_ref().map_or(raw.len(), Bytes::len);
        content.size = size as i64;
        if decoded.is_some() && size != raw.len() {
            content.compression = Some(size as i64 - raw.len() as i64);
        }
        match captured {
            CapturedText::Text(text) => {
                content.text = Some(text);
                content.encoding = None;
            }
            CapturedText::Base64(encoded) => {
                content.text = Some(encoded);
                content.encoding = Some("base64".to_string());
            }
        }
    }
}

/// Undo `Content-Encoding` with the MITM engine's decoder
async fn decode_for_capture(headers: &HeaderMap, raw: Bytes) -> Result<Bytes, String> {
    let encoded = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().eq_ignore_ascii_case("identity"));
    if !encoded {
        return Ok(raw);
    }

    let mut response = Response::new(Body::from(Full::new(raw)));
    *response.headers_mut() = headers.clone();
    let decoded = hudsucker::decode_response(response).map_err(|e| e.to_string())?;
    decoded
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| e.to_string())
}

#[async_trait]
impl Interceptor for HarCaptureInterceptor {
    async fn on_request(&mut self, req: &mut Request<Body>) -> HookResult<Option<Response<Body>>> {
        self.capture_request_head(req);
        self.capture_request_body(req).await;
        Ok(None)
    }

    async fn on_response(&mut self, res: &mut Response<Body>) -> HookResult<()> {
        // A failed exchange keeps its failure response, not the proxy's error page
        if self.recorder.has_failed() {
            return Ok(());
        }
        self.capture_response_head(res);
        self.capture_response_body(res).await;
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn ExchangeListener>> {
        Some(self.recorder.clone())
    }
}
