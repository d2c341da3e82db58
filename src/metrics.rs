use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::Method;

use crate::error::Error;
use crate::response::ResponseEnvelope;
use crate::util::lock_unpoisoned;

/// External observation hooks around the request lifecycle. The dispatcher
/// calls out at hop start and at body-drain time and never reads a result;
/// implementations must not panic or block.
pub trait DispatchObserver: Send + Sync + 'static {
    /// A network attempt is about to be issued. Called once per hop,
    /// including redirect follow-ups.
    fn on_hop_start(&self, method: &Method, uri: &str) {
        let _ = (method, uri);
    }

    /// The response body finished draining: for buffered requests when the
    /// internal drain completes, for streaming requests when the caller
    /// reaches end-of-stream or closes the handle.
    fn on_drain(&self, method: &Method, uri: &str, elapsed: Duration) {
        let _ = (method, uri, elapsed);
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub redirects_followed: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Cheap per-dispatcher counters. Disabled by default; a disabled handle is a
/// no-op on every record call.
#[derive(Clone, Debug, Default)]
pub(crate) struct DispatcherMetrics {
    inner: Option<Arc<DispatcherMetricsInner>>,
}

#[derive(Debug, Default)]
struct DispatcherMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    redirects_followed: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<DispatcherMetricsInner>>,
}

impl DispatcherMetrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(DispatcherMetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_redirect_followed(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.redirects_followed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, envelope: &ResponseEnvelope, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        self.record_latency(latency);
        match envelope.as_result() {
            Ok(response) => {
                inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
            }
            Err(fault) => {
                inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                if let Error::Transport { kind, .. } = fault {
                    inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                    if *kind == crate::error::TransportErrorKind::Timeout {
                        inner.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    self.add_error_count(format!("transport:{kind}"));
                } else {
                    self.add_error_count(fault.code().as_str().to_owned());
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> DispatcherMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return DispatcherMetricsSnapshot {
                requests_started: 0,
                requests_succeeded: 0,
                requests_failed: 0,
                redirects_followed: 0,
                transport_errors: 0,
                timeouts: 0,
                in_flight: 0,
                latency_samples: 0,
                latency_total_ms: 0,
                latency_avg_ms: 0.0,
                status_counts: BTreeMap::new(),
                error_counts: BTreeMap::new(),
            };
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        DispatcherMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            redirects_followed: inner.redirects_followed.load(Ordering::Relaxed),
            transport_errors: inner.transport_errors.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
