use crate::events::{ExchangeEvents, ExchangeListener};
use crate::pipeline::{Exchange, ExchangeContext};
use crate::state::ProxyState;
use crate::transport::{ConnectInfo, Direction, MeteredBody, find_connect_error, is_timeout};
use http::{Method, Request, Response, StatusCode};
use http_body::Body as _;
use hudsucker::{Body, HttpContext, HttpHandler, RequestOrResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;

/// Exchange state carried from the request to the response of one exchange
#[derive(Clone)]
struct InFlight {
    exchange: Arc<Mutex<Exchange>>,
    events: ExchangeEvents,
    url: String,
}

/// Runs every proxied exchange through the interceptor pipeline and reports
/// transport progress to its listeners.
///
/// hudsucker clones the handler for each request, so `in_flight` belongs to a
/// single exchange.
#[derive(Clone)]
pub struct InterceptingHandler {
    state: Arc<ProxyState>,
    mitm: bool,
    aborted: Arc<AtomicBool>,
    in_flight: Option<InFlight>,
}

impl InterceptingHandler {
    pub fn new(state: Arc<ProxyState>, mitm: bool, aborted: Arc<AtomicBool>) -> Self {
        Self {
            state,
            mitm,
            aborted,
            in_flight: None,
        }
    }

    /// Run the response hooks and keep the exchange alive until the body ends
    async fn finish(&self, in_flight: InFlight, mut res: Response<Body>) -> Response<Body> {
        in_flight.exchange.lock().await.on_response(&mut res).await;

        let exchange = in_flight.exchange;
        let aborted = Arc::clone(&self.aborted);
        res.map(move |body| {
            MeteredBody::finishing(body, move || drop(exchange))
                .abortable(aborted)
                .into_body()
        })
    }
}

/// Wrap a response body so its progress reaches the exchange
fn meter_response(res: Response<Body>, events: &ExchangeEvents) -> Response<Body> {
    if res.body().is_end_stream() {
        events.response_received(Instant::now());
        return res;
    }
    let events = events.clone();
    res.map(move |body| MeteredBody::metered(body, events, Direction::Response).into_body())
}

fn failure_response(status: StatusCode) -> Response<Body> {
    let mut response = crate::policy::status_response(status);
    response
        .headers_mut()
        .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    response
}

impl HttpHandler for InterceptingHandler {
    fn handle_request(
        &mut self,
        ctx: &HttpContext,
        mut req: Request<Body>,
    ) -> impl std::future::Future<Output = RequestOrResponse> + Send {
        let client_addr = ctx.client_addr;

        async move {
            if self.aborted.load(Ordering::Acquire) {
                return RequestOrResponse::Response(failure_response(StatusCode::SERVICE_UNAVAILABLE));
            }

            let context = ExchangeContext::from_request(Some(client_addr), &req);
            let url = context.url();
            let mut exchange = self.state.pipeline.begin(&context);
            let events = exchange.events();
            tracing::debug!("Intercepted request: {} {}", req.method(), url);

            // hudsucker owns the tunnel; only a policy rejection stops it
            if req.method() == Method::CONNECT {
                return match exchange.on_request(&mut req).await {
                    Some(response) => RequestOrResponse::Response(response),
                    None => RequestOrResponse::Request(req),
                };
            }

            if let Some(response) = exchange.on_request(&mut req).await {
                // Nothing goes upstream; the exchange completes here
                let now = Instant::now();
                events.request_sending(now);
                events.request_sent(now);
                events.response_receiving(now);

                let in_flight = InFlight {
                    exchange: Arc::new(Mutex::new(exchange)),
                    events: events.clone(),
                    url,
                };
                let response = meter_response(response, &events);
                return RequestOrResponse::Response(self.finish(in_flight, response).await);
            }

            if req.body().is_end_stream() {
                let now = Instant::now();
                events.request_sending(now);
                events.request_sent(now);
            } else {
                let metering = events.clone();
                req = req.map(move |body| {
                    MeteredBody::metered(body, metering, Direction::Request).into_body()
                });
            }

            self.in_flight = Some(InFlight {
                exchange: Arc::new(Mutex::new(exchange)),
                events,
                url,
            });
            RequestOrResponse::Request(req)
        }
    }

    fn handle_response(
        &mut self,
        _ctx: &HttpContext,
        res: Response<Body>,
    ) -> impl std::future::Future<Output = Response<Body>> + Send {
        async move {
            let Some(in_flight) = self.in_flight.take() else {
                return res;
            };
            let events = &in_flight.events;
            events.response_receiving(Instant::now());

            match res.extensions().get::<ConnectInfo>() {
                Some(info) => match info.claim() {
                    Some(timings) => timings.replay(events),
                    None => events.connection_reused(Instant::now()),
                },
                None => tracing::trace!("No connection info for {}", in_flight.url),
            }

            tracing::debug!("Intercepted response: {} for {}", res.status(), in_flight.url);
            let res = meter_response(res, events);
            self.finish(in_flight, res).await
        }
    }

    fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> impl std::future::Future<Output = Response<Body>> + Send {
        async move {
            let now = Instant::now();
            let Some(in_flight) = self.in_flight.take() else {
                tracing::warn!("Upstream request failed: {}", err);
                return failure_response(StatusCode::BAD_GATEWAY);
            };

            let events = &in_flight.events;
            let status = if let Some(connect) = find_connect_error(&err) {
                tracing::debug!("{} failed: {}", in_flight.url, connect);
                connect.replay(events);
                StatusCode::BAD_GATEWAY
            } else if is_timeout(&err) {
                tracing::debug!("{} timed out", in_flight.url);
                events.response_timed_out(now);
                StatusCode::GATEWAY_TIMEOUT
            } else {
                tracing::warn!("Request to {} failed: {}", in_flight.url, err);
                StatusCode::BAD_GATEWAY
            };

            let res = meter_response(failure_response(status), events);
            self.finish(in_flight, res).await
        }
    }

    fn should_intercept(
        &mut self,
        _ctx: &HttpContext,
        req: &Request<Body>,
    ) -> impl std::future::Future<Output = bool> + Send {
        let intercept = self.mitm;
        if !intercept {
            tracing::debug!("Tunnelling {} without interception", req.uri());
        }
        async move { intercept }
    }
}
