use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::metrics::DispatchObserver;
use crate::redirect::RedirectPolicy;
use crate::tls::TlsMaterial;

/// Explicit, construction-time configuration for a
/// [`Dispatcher`](crate::Dispatcher). Nothing here is read from the
/// environment; every knob is set by the embedding SDK before the dispatcher
/// is built and is immutable afterwards.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub user_agent: String,
    pub worker_threads: usize,
    pub relay_capacity: usize,
    pub redirect_policy: RedirectPolicy,
    pub force_redirect_method: bool,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_max_idle_connections: usize,
    pub default_headers: HeaderMap,
    pub tls: TlsMaterial,
    pub metrics_enabled: bool,
    pub observer: Option<Arc<dyn DispatchObserver>>,
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DispatcherConfig")
            .field("user_agent", &self.user_agent)
            .field("worker_threads", &self.worker_threads)
            .field("relay_capacity", &self.relay_capacity)
            .field("redirect_policy", &self.redirect_policy)
            .field("force_redirect_method", &self.force_redirect_method)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("metrics_enabled", &self.metrics_enabled)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_owned(),
            worker_threads: 4,
            relay_capacity: 16,
            redirect_policy: RedirectPolicy::follow(),
            force_redirect_method: false,
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 8,
            pool_max_idle_connections: 64,
            default_headers: HeaderMap::new(),
            tls: TlsMaterial::default(),
            metrics_enabled: false,
            observer: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Number of body chunks buffered between the delivery thread and the
    /// consumer before the delivery thread blocks.
    pub fn with_relay_capacity(mut self, relay_capacity: usize) -> Self {
        self.relay_capacity = relay_capacity;
        self
    }

    pub fn with_redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    /// Preserve the request method across 301/302 instead of rewriting to
    /// GET. 303 still rewrites and 307/308 still preserve regardless.
    pub fn with_force_redirect_method(mut self, force_redirect_method: bool) -> Self {
        self.force_redirect_method = force_redirect_method;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn with_pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn with_pool_max_idle_connections(mut self, pool_max_idle_connections: usize) -> Self {
        self.pool_max_idle_connections = pool_max_idle_connections;
        self
    }

    /// Headers applied to every request; per-request headers override on
    /// name collision.
    pub fn with_default_headers(mut self, default_headers: HeaderMap) -> Self {
        self.default_headers = default_headers;
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_metrics_enabled(mut self, metrics_enabled: bool) -> Self {
        self.metrics_enabled = metrics_enabled;
        self
    }

    /// Hook points invoked at hop start and at body-drain time.
    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}
