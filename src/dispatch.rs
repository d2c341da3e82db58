use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tracing::{debug, error, info_span};

use crate::config::DispatcherConfig;
use crate::error::{Error, TransportErrorKind};
use crate::metrics::{DispatchObserver, DispatcherMetrics, DispatcherMetricsSnapshot};
use crate::promise::{Deliverer, Promise};
use crate::redirect::{RedirectContext, RedirectDecision, RedirectPolicy};
use crate::relay;
use crate::request::{BodyMode, RequestBuilder, RequestDescription, ResponseTransform};
use crate::response::{Response, ResponseBody, ResponseEnvelope, StreamHandle};
use crate::tls::TlsMaterial;
use crate::transport::{Transport, TransportRequest, UreqTransport, WorkerPool};
use crate::util::{merge_headers, redact_uri_for_logs};

/// Entry point of the crate: accepts request descriptions, drives each one
/// through transport attempts and redirect hops on a pooled worker thread,
/// and completes the caller's promise exactly once with the terminal
/// outcome.
pub struct Dispatcher {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    metrics: DispatcherMetrics,
}

impl Dispatcher {
    /// Builds a dispatcher over the pooled `ureq` transport.
    pub fn new(config: DispatcherConfig) -> Self {
        let transport = Arc::new(UreqTransport::from_config(&config));
        Self::with_transport(config, transport)
    }

    /// Builds a dispatcher over a caller-supplied transport.
    pub fn with_transport(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Self {
        let metrics = if config.metrics_enabled {
            DispatcherMetrics::enabled()
        } else {
            DispatcherMetrics::disabled()
        };
        let pool = WorkerPool::new(config.worker_threads);
        Self {
            config,
            transport,
            pool,
            metrics,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics_snapshot(&self) -> DispatcherMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn request(&self, method: Method, uri: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, uri.into())
    }

    pub fn get(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, uri)
    }

    pub fn post(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, uri)
    }

    pub fn put(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, uri)
    }

    pub fn patch(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, uri)
    }

    pub fn delete(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, uri)
    }

    pub fn head(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, uri)
    }

    /// Queues the chain on the worker pool and returns the caller's half of
    /// the promise. The promise completes exactly once, with either the
    /// terminal response (any status) or the fault that ended the chain.
    pub(crate) fn dispatch(
        &self,
        description: RequestDescription,
    ) -> Result<Promise<ResponseEnvelope>, Error> {
        let (promise, deliverer) = Promise::new();
        self.metrics.record_request_started();

        let job = ChainJob {
            transport: Arc::clone(&self.transport),
            metrics: self.metrics.clone(),
            observer: self.config.observer.clone(),
            redirect_policy: description
                .redirect_policy
                .unwrap_or(self.config.redirect_policy),
            force_redirect_method: description
                .force_redirect_method
                .unwrap_or(self.config.force_redirect_method),
            relay_capacity: self.config.relay_capacity,
            timeout: description.timeout.or(self.config.request_timeout),
            method: description.method,
            uri: description.uri,
            headers: merge_headers(&self.config.default_headers, &description.headers),
            body: description.body,
            tls: description.tls,
            body_mode: description.body_mode,
            transform: description.transform,
            started_at: Instant::now(),
        };
        self.pool.spawn(move || job.run(deliverer))?;
        Ok(promise)
    }
}

/// Everything one chain needs, detached from the dispatcher so the worker
/// thread owns it outright.
struct ChainJob {
    transport: Arc<dyn Transport>,
    metrics: DispatcherMetrics,
    observer: Option<Arc<dyn DispatchObserver>>,
    redirect_policy: RedirectPolicy,
    force_redirect_method: bool,
    relay_capacity: usize,
    timeout: Option<Duration>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    tls: Option<TlsMaterial>,
    body_mode: BodyMode,
    transform: Option<ResponseTransform>,
    started_at: Instant,
}

/// Outcome of a single network attempt, before redirect evaluation.
struct Hop {
    status: http::StatusCode,
    headers: HeaderMap,
    stream: crate::relay::BodyStream,
}

impl ChainJob {
    fn run(mut self, deliverer: Deliverer<ResponseEnvelope>) {
        let redacted = redact_uri_for_logs(&self.uri.to_string());
        let span = info_span!("request", method = %self.method, uri = %redacted);
        let _entered = span.enter();
        let _in_flight = self.metrics.enter_in_flight();

        let envelope = self.run_chain();
        let envelope = self.apply_transform(envelope);

        self.metrics
            .record_delivered(&envelope, self.started_at.elapsed());
        if deliverer.deliver(envelope).is_err() {
            // Unreachable unless a second delivery path is introduced.
            error!(uri = %redacted, "request outcome was already delivered");
            debug_assert!(false, "chain job delivered twice");
        }
    }

    fn run_chain(&mut self) -> ResponseEnvelope {
        let mut trace: Vec<Uri> = Vec::new();

        loop {
            let redacted_uri = redact_uri_for_logs(&self.uri.to_string());
            let mut hop = match self.run_hop(&redacted_uri) {
                Ok(hop) => hop,
                Err(fault) => return ResponseEnvelope::failure(fault),
            };

            let decision = crate::redirect::evaluate(RedirectContext {
                status: hop.status,
                method: &self.method,
                current_uri: &self.uri,
                headers: &self.headers,
                response_headers: &hop.headers,
                trace: &trace,
                policy: self.redirect_policy,
                force_method: self.force_redirect_method,
                redacted_uri: &redacted_uri,
            });

            match decision {
                RedirectDecision::Stop => {
                    return self.finish_hop(hop, &trace);
                }
                RedirectDecision::Fail(fault) => {
                    let _ = hop.stream.close();
                    return ResponseEnvelope::failure(fault);
                }
                RedirectDecision::Follow(next) => {
                    // The intermediate body is never surfaced; discarding it
                    // also unblocks the delivery thread for this hop.
                    if let Err(fault) = hop.stream.close() {
                        return ResponseEnvelope::failure(fault);
                    }
                    debug!(
                        status = hop.status.as_u16(),
                        next_uri = %redact_uri_for_logs(&next.uri.to_string()),
                        "following redirect"
                    );
                    self.metrics.record_redirect_followed();
                    if next.method != self.method {
                        self.body = None;
                    }
                    trace.push(std::mem::replace(&mut self.uri, next.uri));
                    self.method = next.method;
                    self.headers = next.headers;
                }
            }
        }
    }

    /// Runs one attempt: the transport executes on its own delivery thread
    /// and this worker consumes the relay.
    fn run_hop(&self, redacted_uri: &str) -> Result<Hop, Error> {
        if let Some(observer) = &self.observer {
            observer.on_hop_start(&self.method, redacted_uri);
        }
        let (sink, head_rx, mut stream) =
            relay::channel(&self.method, redacted_uri, self.relay_capacity);
        let request = TransportRequest {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
            tls: self.tls.clone(),
        };

        let transport = Arc::clone(&self.transport);
        let delivery = move || transport.execute(request, sink);
        // A failed spawn drops the sink, which records a fault in the outcome
        // cell; the recv below surfaces it.
        let _ = std::thread::Builder::new()
            .name("courier-delivery".to_owned())
            .spawn(delivery);

        match head_rx.recv() {
            Ok(head) => Ok(Hop {
                status: head.status,
                headers: head.headers,
                stream,
            }),
            // The sink was dropped before headers arrived; the outcome cell
            // holds the fault.
            Err(_) => match stream.close() {
                Err(fault) => Err(fault),
                Ok(()) => Err(Error::transport(
                    TransportErrorKind::Other,
                    &self.method,
                    redacted_uri,
                    "transport ended without headers or a fault",
                )),
            },
        }
    }

    fn finish_hop(&self, mut hop: Hop, trace: &[Uri]) -> ResponseEnvelope {
        let final_uri = self.uri.to_string();
        let redirect_trace: Vec<String> = trace
            .iter()
            .map(|uri| redact_uri_for_logs(&uri.to_string()))
            .collect();

        let body = match self.body_mode {
            BodyMode::Text | BodyMode::Bytes => {
                let bytes = match hop.stream.read_to_bytes() {
                    Ok(bytes) => bytes,
                    Err(fault) => return ResponseEnvelope::failure(fault),
                };
                self.notify_drained();
                if self.body_mode == BodyMode::Text {
                    ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    ResponseBody::Buffered(bytes)
                }
            }
            BodyMode::Stream => {
                if let Some(observer) = &self.observer {
                    let observer = Arc::clone(observer);
                    let method = self.method.clone();
                    let uri = redact_uri_for_logs(&final_uri);
                    let started_at = self.started_at;
                    hop.stream.set_drain_hook(move || {
                        observer.on_drain(&method, &uri, started_at.elapsed());
                    });
                }
                ResponseBody::Stream(StreamHandle::new(hop.stream))
            }
        };

        ResponseEnvelope::success(Response::new(
            hop.status,
            hop.headers,
            final_uri,
            redirect_trace,
            body,
        ))
    }

    fn notify_drained(&self) {
        if let Some(observer) = &self.observer {
            observer.on_drain(
                &self.method,
                &redact_uri_for_logs(&self.uri.to_string()),
                self.started_at.elapsed(),
            );
        }
    }

    /// Applies the caller's transform on this delivery thread. Failures and
    /// panics become the delivered outcome instead of poisoning the worker.
    fn apply_transform(&mut self, envelope: ResponseEnvelope) -> ResponseEnvelope {
        let Some(transform) = self.transform.take() else {
            return envelope;
        };
        let response = match envelope.into_result() {
            Ok(response) => response,
            Err(fault) => return ResponseEnvelope::failure(fault),
        };

        match catch_unwind(AssertUnwindSafe(|| transform(response))) {
            Ok(Ok(transformed)) => ResponseEnvelope::success(transformed),
            Ok(Err(fault)) => ResponseEnvelope::failure(fault),
            Err(panic) => ResponseEnvelope::failure(Error::Callback {
                message: panic_message(&*panic),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "response transform panicked".to_owned()
    }
}
