use super::is_timeout;
use crate::events::{ExchangeEvents, ExchangeListener};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use hudsucker::Body;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Request,
    Response,
}

type Finisher = Box<dyn FnOnce() + Send>;

/// Reports a body's progress to the exchange and runs a finisher once it ends
/// or is dropped.
pub(crate) struct MeteredBody {
    inner: Pin<Box<Body>>,
    metering: Option<(ExchangeEvents, Direction)>,
    started: bool,
    finished: bool,
    on_finish: Mutex<Option<Finisher>>,
    abort: Option<Arc<AtomicBool>>,
}

impl MeteredBody {
    pub(crate) fn metered(inner: Body, events: ExchangeEvents, direction: Direction) -> Self {
        Self::new(inner, Some((events, direction)), None)
    }

    /// Runs `finish` when the body has been fully read or dropped
    pub(crate) fn finishing(inner: Body, finish: impl FnOnce() + Send + 'static) -> Self {
        Self::new(inner, None, Some(Box::new(finish)))
    }

    fn new(inner: Body, metering: Option<(ExchangeEvents, Direction)>, on_finish: Option<Finisher>) -> Self {
        Self {
            inner: Box::pin(inner),
            metering,
            started: false,
            finished: false,
            on_finish: Mutex::new(on_finish),
            abort: None,
        }
    }

    /// Cut the body short once `abort` is raised
    pub(crate) fn abortable(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub(crate) fn into_body(self) -> Body {
        Body::from(self.boxed())
    }

    fn on_start(&mut self) {
        self.started = true;
        if let Some((events, Direction::Request)) = &self.metering {
            events.request_sending(Instant::now());
        }
    }

    fn on_chunk(&self, len: usize) {
        match &self.metering {
            Some((events, Direction::Request)) => events.request_body_chunk(len),
            Some((events, Direction::Response)) => events.response_body_chunk(len),
            None => {}
        }
    }

    fn on_end(&mut self) {
        match &self.metering {
            Some((events, Direction::Request)) => events.request_sent(Instant::now()),
            Some((events, Direction::Response)) => events.response_received(Instant::now()),
            None => {}
        }
        self.finish();
    }

    fn on_error(&mut self, err: &hudsucker::Error) {
        if let Some((events, Direction::Response)) = &self.metering
            && is_timeout(err)
        {
            events.response_timed_out(Instant::now());
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(finish) = self.on_finish.get_mut().take() {
            finish();
        }
    }
}

impl HttpBody for MeteredBody {
    type Data = Bytes;
    type Error = hudsucker::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.abort.as_ref().is_some_and(|a| a.load(Ordering::Acquire)) {
            tracing::debug!("Proxy aborted; truncating body");
            this.finish();
            return Poll::Ready(None);
        }
        if !this.started {
            this.on_start();
        }

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.on_chunk(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.on_error(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.on_end();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}
