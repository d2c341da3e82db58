use std::io::Read;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tracing::{debug, trace};

use crate::error::{Error, TransportErrorKind};
use crate::relay::EventSink;
use crate::tls::TlsMaterial;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

/// One fully resolved network attempt. Redirect handling happens above this
/// layer, so the transport sees exactly one URI per call and the body is
/// always replayable bytes.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    /// Per-request TLS material; `None` uses the transport's configured
    /// material.
    pub tls: Option<TlsMaterial>,
}

/// Delivery backend. Implementations perform the attempt and report every
/// outcome through the sink: `headers`, zero or more `body_chunk`s, then
/// `complete` or `error`. A transport must never panic across this boundary
/// and must never retry on its own.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: TransportRequest, sink: EventSink);
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of delivery threads. Requests queue when all threads are
/// busy; dropping the pool joins the threads after in-flight jobs finish.
pub(crate) struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_threads: usize) -> Self {
        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = (0..worker_threads.max(1))
            .map(|index| {
                let named_rx = Arc::clone(&job_rx);
                match std::thread::Builder::new()
                    .name(format!("courier-worker-{index}"))
                    .spawn(move || worker_loop(&named_rx))
                {
                    Ok(worker) => worker,
                    Err(_) => {
                        let unnamed_rx = Arc::clone(&job_rx);
                        std::thread::spawn(move || worker_loop(&unnamed_rx))
                    }
                }
            })
            .collect();
        Self {
            job_tx: Some(job_tx),
            workers,
        }
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        match &self.job_tx {
            Some(job_tx) => job_tx.send(Box::new(job)).map_err(|_| Error::PoolClosed),
            None => Err(Error::PoolClosed),
        }
    }
}

fn worker_loop(job_rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let job_rx = lock_unpoisoned(job_rx);
            job_rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.job_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

const BODY_CHUNK_LEN: usize = 8192;

/// Production transport backed by a pooled `ureq` agent.
///
/// The agent is rebuilt only when the TLS material changes; connection
/// pooling and keep-alive stay inside `ureq`.
pub struct UreqTransport {
    user_agent: String,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    pool_max_idle_connections: usize,
    tls: TlsMaterial,
    agent: Mutex<Option<(Vec<u8>, ureq::Agent)>>,
}

impl UreqTransport {
    pub fn from_config(config: &crate::config::DispatcherConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            pool_idle_timeout: config.pool_idle_timeout,
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            pool_max_idle_connections: config.pool_max_idle_connections,
            tls: config.tls.clone(),
            agent: Mutex::new(None),
        }
    }

    fn agent(&self, tls_override: Option<&TlsMaterial>) -> Result<ureq::Agent, Error> {
        let tls = tls_override.unwrap_or(&self.tls);
        let fingerprint = tls.fingerprint();
        let mut cached = lock_unpoisoned(&self.agent);
        if let Some((cached_fingerprint, agent)) = cached.as_ref()
            && *cached_fingerprint == fingerprint
        {
            return Ok(agent.clone());
        }

        let tls_config = tls.build_tls_config()?;
        // Redirect handling lives above the transport; the agent must hand
        // back 3xx responses untouched.
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .user_agent(&self.user_agent)
            .max_idle_age(self.pool_idle_timeout)
            .max_idle_connections_per_host(self.pool_max_idle_per_host)
            .max_idle_connections(self.pool_max_idle_connections)
            .tls_config(tls_config)
            .build();
        let agent = config.new_agent();
        *cached = Some((fingerprint, agent.clone()));
        debug!(user_agent = %self.user_agent, "built ureq agent");
        Ok(agent)
    }

    fn run(
        &self,
        request: &TransportRequest,
        uri_text: &str,
    ) -> Result<ureq::http::Response<ureq::Body>, Error> {
        let agent = self.agent(request.tls.as_ref())?;

        let body = request
            .body
            .as_ref()
            .map(|body| body.to_vec())
            .unwrap_or_default();
        let mut http_request = ureq::http::Request::builder()
            .method(request.method.clone())
            .uri(uri_text)
            .body(body)
            .map_err(|source| {
                Error::transport(
                    TransportErrorKind::Other,
                    &request.method,
                    &redact_uri_for_logs(uri_text),
                    source,
                )
            })?;
        *http_request.headers_mut() = request.headers.clone();

        let configured_request = agent
            .configure_request(http_request)
            .timeout_connect(Some(self.connect_timeout))
            .timeout_global(request.timeout)
            .timeout_per_call(request.timeout)
            .timeout_recv_response(request.timeout)
            .timeout_recv_body(request.timeout)
            .build();

        agent.run(configured_request).map_err(|source| {
            let kind = classify_ureq_transport_error(&source);
            Error::transport(kind, &request.method, &redact_uri_for_logs(uri_text), source)
        })
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: TransportRequest, mut sink: EventSink) {
        let uri_text = request.uri.to_string();
        let mut response = match self.run(&request, &uri_text) {
            Ok(response) => response,
            Err(fault) => {
                sink.error(fault);
                return;
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        sink.headers(status, headers);

        let mut reader = response.body_mut().as_reader();
        let mut chunk = [0_u8; BODY_CHUNK_LEN];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    if !sink.body_chunk(Bytes::copy_from_slice(&chunk[..read])) {
                        trace!(uri = %redact_uri_for_logs(&uri_text), "consumer closed mid-body");
                        break;
                    }
                }
                Err(io_error) => {
                    let kind = wrapped_ureq_error(&io_error)
                        .map(classify_ureq_transport_error)
                        .unwrap_or_else(|| classify_io_error(&io_error));
                    sink.error(Error::transport(
                        kind,
                        &request.method,
                        &redact_uri_for_logs(&uri_text),
                        io_error,
                    ));
                    return;
                }
            }
        }
        sink.complete();
    }
}

fn classify_ureq_transport_error(error: &ureq::Error) -> TransportErrorKind {
    match error {
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ureq::Error::Tls(_) => TransportErrorKind::Tls,
        #[cfg(feature = "tls-rustls")]
        ureq::Error::Rustls(_) => TransportErrorKind::Tls,
        #[cfg(feature = "tls-native")]
        ureq::Error::NativeTls(_) => TransportErrorKind::Tls,
        #[cfg(feature = "tls-native")]
        ureq::Error::Der(_) => TransportErrorKind::Tls,
        ureq::Error::Pem(_) => TransportErrorKind::Tls,
        ureq::Error::ConnectProxyFailed(_) | ureq::Error::ConnectionFailed => {
            TransportErrorKind::Connect
        }
        ureq::Error::Io(source) => classify_io_error(source),
        _ => TransportErrorKind::Other,
    }
}

fn classify_io_error(io_error: &std::io::Error) -> TransportErrorKind {
    match io_error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportErrorKind::Timeout
        }
        std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => TransportErrorKind::Read,
        _ => TransportErrorKind::Other,
    }
}

fn wrapped_ureq_error(io_error: &std::io::Error) -> Option<&ureq::Error> {
    io_error
        .get_ref()
        .and_then(|source| source.downcast_ref::<ureq::Error>())
}
