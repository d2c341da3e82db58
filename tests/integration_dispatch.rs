use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use courier::{
    BodyMode, DispatchObserver, Dispatcher, DispatcherConfig, Error, ErrorCode, EventSink,
    RedirectPolicy, ResponseBody, Transport, TransportErrorKind, TransportRequest,
};
use http::header::{AUTHORIZATION, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

enum Script {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        chunks: Vec<Vec<u8>>,
        fault_after_chunks: Option<Error>,
    },
    Fail(Error),
}

impl Script {
    fn ok(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            chunks: vec![body.as_bytes().to_vec()],
            fault_after_chunks: None,
        }
    }

    fn redirect(status: u16, location: &str) -> Self {
        Self::Respond {
            status,
            headers: vec![("location", location.to_owned())],
            chunks: Vec::new(),
            fault_after_chunks: None,
        }
    }
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    captured: Mutex<Vec<CapturedRequest>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("lock captured").clone()
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: TransportRequest, mut sink: EventSink) {
        self.captured
            .lock()
            .expect("lock captured")
            .push(CapturedRequest {
                method: request.method.clone(),
                uri: request.uri.to_string(),
                headers: request.headers.clone(),
                body: request.body.as_ref().map(|body| body.to_vec()),
            });

        let script = self
            .scripts
            .lock()
            .expect("lock scripts")
            .pop_front()
            .unwrap_or(Script::ok(200, "unscripted"));

        match script {
            Script::Fail(fault) => sink.error(fault),
            Script::Respond {
                status,
                headers,
                chunks,
                fault_after_chunks,
            } => {
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.insert(
                        name,
                        HeaderValue::from_str(&value).expect("scripted header value"),
                    );
                }
                sink.headers(
                    StatusCode::from_u16(status).expect("scripted status"),
                    header_map,
                );
                for chunk in chunks {
                    if !sink.body_chunk(Bytes::from(chunk)) {
                        return;
                    }
                }
                match fault_after_chunks {
                    Some(fault) => sink.error(fault),
                    None => sink.complete(),
                }
            }
        }
    }
}

fn read_fault(uri: &str) -> Error {
    Error::Transport {
        kind: TransportErrorKind::Read,
        method: Method::GET,
        uri: uri.to_owned(),
        source: Arc::new(std::io::Error::other("connection reset")),
    }
}

fn dispatcher_with(
    config: DispatcherConfig,
    scripts: Vec<Script>,
) -> (Dispatcher, Arc<ScriptedTransport>) {
    let transport = ScriptedTransport::new(scripts);
    let dispatcher = Dispatcher::with_transport(config, Arc::clone(&transport) as Arc<dyn Transport>);
    (dispatcher, transport)
}

#[test]
fn delivers_a_simple_success_response() {
    let (dispatcher, transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(200, "hello")]);

    let response = dispatcher
        .get("http://api.test/v1/hello")
        .call()
        .expect("success response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().expect("body"), Bytes::from_static(b"hello"));
    assert_eq!(response.final_uri(), "http://api.test/v1/hello");
    assert!(response.redirect_trace().is_empty());
    assert_eq!(transport.captured().len(), 1);
}

#[test]
fn non_success_status_is_still_a_response() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default(),
        vec![Script::ok(500, "boom")],
    );

    let response = dispatcher
        .get("http://api.test/v1/broken")
        .call()
        .expect("a 500 is a response, not a fault");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.is_success());
    assert_eq!(response.text_lossy().expect("body"), "boom");
}

#[test]
fn follows_302_rewriting_post_to_get_and_stripping_credentials() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::follow()),
        vec![
            Script::redirect(302, "http://api.test/moved"),
            Script::ok(200, "done"),
        ],
    );

    let response = dispatcher
        .post("http://api.test/v1/items")
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer token"))
        .text("payload")
        .call()
        .expect("redirected response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.final_uri(), "http://api.test/moved");
    assert_eq!(response.redirect_trace(), ["http://api.test/v1/items"]);

    let captured = transport.captured();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].method, Method::POST);
    assert_eq!(captured[1].method, Method::GET);
    assert_eq!(captured[1].uri, "http://api.test/moved");
    assert!(!captured[1].headers.contains_key(AUTHORIZATION));
    assert!(captured[1].body.is_none());
}

#[test]
fn force_method_preserves_post_across_302() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default()
            .with_redirect_policy(RedirectPolicy::follow())
            .with_force_redirect_method(true),
        vec![
            Script::redirect(302, "http://api.test/moved"),
            Script::ok(200, "done"),
        ],
    );

    dispatcher
        .post("http://api.test/v1/items")
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer token"))
        .text("payload")
        .call()
        .expect("redirected response");

    let captured = transport.captured();
    assert_eq!(captured[1].method, Method::POST);
    // Same origin, same method: credentials and body survive the hop.
    assert!(captured[1].headers.contains_key(AUTHORIZATION));
    assert_eq!(captured[1].body.as_deref(), Some(b"payload".as_slice()));
}

#[test]
fn see_other_rewrites_to_get_even_when_method_is_forced() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default()
            .with_redirect_policy(RedirectPolicy::follow())
            .with_force_redirect_method(true),
        vec![
            Script::redirect(303, "http://api.test/result"),
            Script::ok(200, "done"),
        ],
    );

    dispatcher
        .post("http://api.test/v1/jobs")
        .text("job body")
        .call()
        .expect("redirected response");

    let captured = transport.captured();
    assert_eq!(captured[1].method, Method::GET);
    assert!(captured[1].body.is_none());
}

#[test]
fn temporary_redirect_preserves_method_body_and_credentials_same_origin() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::follow()),
        vec![
            Script::redirect(307, "http://api.test/retry"),
            Script::ok(200, "done"),
        ],
    );

    dispatcher
        .post("http://api.test/v1/items")
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer token"))
        .text("payload")
        .call()
        .expect("redirected response");

    let captured = transport.captured();
    assert_eq!(captured[1].method, Method::POST);
    assert!(captured[1].headers.contains_key(AUTHORIZATION));
    assert_eq!(captured[1].body.as_deref(), Some(b"payload".as_slice()));
}

#[test]
fn cross_origin_redirect_strips_credentials_but_keeps_method() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::follow()),
        vec![
            Script::redirect(307, "http://other.test/v1/items"),
            Script::ok(200, "done"),
        ],
    );

    dispatcher
        .post("http://api.test/v1/items")
        .header(AUTHORIZATION, HeaderValue::from_static("Bearer token"))
        .text("payload")
        .call()
        .expect("redirected response");

    let captured = transport.captured();
    assert_eq!(captured[1].method, Method::POST);
    assert_eq!(captured[1].uri, "http://other.test/v1/items");
    assert!(!captured[1].headers.contains_key(AUTHORIZATION));
    assert_eq!(captured[1].body.as_deref(), Some(b"payload".as_slice()));
}

#[test]
fn too_many_redirects_fails_with_the_visited_trace() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::limited(2)),
        vec![
            Script::redirect(302, "http://api.test/hop1?token=secret"),
            Script::redirect(302, "http://api.test/hop2"),
            Script::redirect(302, "http://api.test/hop3"),
        ],
    );

    let error = dispatcher
        .get("http://api.test/start")
        .call()
        .expect_err("redirect budget exhausted");

    match error {
        Error::TooManyRedirects {
            max_redirects,
            visited,
            ..
        } => {
            assert_eq!(max_redirects, 2);
            assert_eq!(visited.len(), 2);
            assert_eq!(visited[0], "http://api.test/start");
            // Query strings never leak into the trace.
            assert_eq!(visited[1], "http://api.test/hop1");
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn redirect_without_location_fails_the_chain() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::follow()),
        vec![Script::Respond {
            status: 302,
            headers: Vec::new(),
            chunks: Vec::new(),
            fault_after_chunks: None,
        }],
    );

    let error = dispatcher
        .get("http://api.test/start")
        .call()
        .expect_err("missing location is a fault");
    assert_eq!(error.code(), ErrorCode::MissingRedirectLocation);
}

#[test]
fn transport_fault_is_delivered_as_failure() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default(),
        vec![Script::Fail(Error::Transport {
            kind: TransportErrorKind::Timeout,
            method: Method::GET,
            uri: "http://api.test/slow".to_owned(),
            source: Arc::new(std::io::Error::other("timed out")),
        })],
    );

    let error = dispatcher
        .get("http://api.test/slow")
        .call()
        .expect_err("transport fault");
    match error {
        Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Timeout),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn streaming_response_raises_a_mid_body_fault_at_end_of_stream() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default(),
        vec![Script::Respond {
            status: 200,
            headers: Vec::new(),
            chunks: vec![b"first".to_vec(), b"second".to_vec()],
            fault_after_chunks: Some(read_fault("http://api.test/stream")),
        }],
    );

    let response = dispatcher
        .get("http://api.test/stream")
        .streaming()
        .call()
        .expect("head arrived before the fault");
    let stream = response.stream().expect("streaming body");

    let mut collected = Vec::new();
    let mut chunk = [0_u8; 4];
    let error = loop {
        match stream.read_chunk(&mut chunk) {
            Ok(0) => panic!("fault should be raised instead of clean end-of-stream"),
            Ok(read) => collected.extend_from_slice(&chunk[..read]),
            Err(error) => break error,
        }
    };
    assert_eq!(collected, b"firstsecond");
    assert_eq!(error.code(), ErrorCode::Transport);
}

#[test]
fn streaming_close_discards_the_remaining_body() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default().with_relay_capacity(1),
        vec![Script::Respond {
            status: 200,
            headers: Vec::new(),
            chunks: (0..64).map(|_| vec![0_u8; 1024]).collect(),
            fault_after_chunks: None,
        }],
    );

    let response = dispatcher
        .get("http://api.test/large")
        .streaming()
        .call()
        .expect("streaming response");
    let stream = response.stream().expect("streaming body");

    let mut chunk = [0_u8; 512];
    let read = stream.read_chunk(&mut chunk).expect("first chunk");
    assert!(read > 0);
    stream.close().expect("clean close");
    assert_eq!(stream.read_chunk(&mut chunk).expect("closed stream"), 0);
}

#[test]
fn promise_outcome_is_shared_by_every_waiter() {
    let (dispatcher, _transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(200, "shared")]);

    let promise = dispatcher
        .get("http://api.test/shared")
        .dispatch()
        .expect("dispatch accepted");

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let promise = promise.clone();
            thread::spawn(move || {
                promise
                    .wait()
                    .expect("delivery")
                    .to_result()
                    .expect("success")
                    .status()
            })
        })
        .collect();
    for waiter in waiters {
        assert_eq!(waiter.join().expect("waiter thread"), StatusCode::OK);
    }
}

#[test]
fn transform_runs_before_delivery() {
    let (dispatcher, _transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(404, "missing")]);

    let error = dispatcher
        .get("http://api.test/v1/users/42")
        .transform(|response| {
            if response.status() == StatusCode::NOT_FOUND {
                Err(Error::Callback {
                    message: "user not found".to_owned(),
                })
            } else {
                Ok(response)
            }
        })
        .call()
        .expect_err("transform rejected the response");
    assert_eq!(error.code(), ErrorCode::Callback);
}

#[test]
fn transform_panic_is_delivered_as_a_callback_fault() {
    let (dispatcher, _transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(200, "ok")]);

    let error = dispatcher
        .get("http://api.test/v1/panicky")
        .transform(|_response| panic!("transform exploded"))
        .call()
        .expect_err("panic becomes a fault");
    match error {
        Error::Callback { message } => assert_eq!(message, "transform exploded"),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn form_body_is_urlencoded_with_the_matching_content_type() {
    let (dispatcher, transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(200, "ok")]);

    dispatcher
        .post("http://api.test/v1/login")
        .form(&[("user", "alice"), ("note", "a&b=c")])
        .expect("serializable form")
        .call()
        .expect("response");

    let captured = transport.captured();
    assert_eq!(
        captured[0].headers.get("content-type"),
        Some(&HeaderValue::from_static(
            "application/x-www-form-urlencoded"
        ))
    );
    assert_eq!(
        captured[0].body.as_deref(),
        Some(b"user=alice&note=a%26b%3Dc".as_slice())
    );
}

#[test]
fn query_parameters_are_appended_to_the_request_uri() {
    let (dispatcher, transport) =
        dispatcher_with(DispatcherConfig::default(), vec![Script::ok(200, "ok")]);

    dispatcher
        .get("http://api.test/v1/users?page=2")
        .query_pair("limit", "50")
        .query(&[("sort", "name asc")])
        .expect("serializable query")
        .call()
        .expect("response");

    let captured = transport.captured();
    assert_eq!(
        captured[0].uri,
        "http://api.test/v1/users?page=2&limit=50&sort=name+asc"
    );
}

#[test]
fn blocking_call_reraises_the_failure_cause() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default(),
        vec![Script::Fail(Error::Transport {
            kind: TransportErrorKind::Connect,
            method: Method::GET,
            uri: "http://api.test/down".to_owned(),
            source: Arc::new(std::io::Error::other("refused")),
        })],
    );

    let error = dispatcher
        .get("http://api.test/down")
        .call()
        .expect_err("the recorded fault is re-raised");
    assert_eq!(error.code(), ErrorCode::Transport);
}

#[test]
fn default_headers_apply_and_per_request_headers_override() {
    let mut default_headers = HeaderMap::new();
    default_headers.insert("x-sdk-version", HeaderValue::from_static("1.0"));
    default_headers.insert("x-channel", HeaderValue::from_static("default"));

    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_default_headers(default_headers),
        vec![Script::ok(200, "ok")],
    );

    dispatcher
        .get("http://api.test/v1/ping")
        .try_header("x-channel", "override")
        .expect("valid header")
        .call()
        .expect("response");

    let captured = transport.captured();
    assert_eq!(
        captured[0].headers.get("x-sdk-version"),
        Some(&HeaderValue::from_static("1.0"))
    );
    assert_eq!(
        captured[0].headers.get("x-channel"),
        Some(&HeaderValue::from_static("override"))
    );
}

#[test]
fn text_body_mode_delivers_a_decoded_body() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default(),
        vec![Script::ok(200, "plain text payload")],
    );

    let response = dispatcher
        .get("http://api.test/v1/motd")
        .body_mode(BodyMode::Text)
        .call()
        .expect("response");

    match response.body() {
        ResponseBody::Text(text) => assert_eq!(text, "plain text payload"),
        other => panic!("expected a text body, got {other:?}"),
    }
    assert!(response.stream().is_none());
    assert_eq!(response.text_lossy().expect("text"), "plain text payload");
}

#[test]
fn per_request_redirect_policy_overrides_the_dispatcher_default() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::none()),
        vec![
            Script::redirect(302, "http://api.test/moved"),
            Script::ok(200, "done"),
        ],
    );

    let response = dispatcher
        .get("http://api.test/start")
        .redirect_policy(RedirectPolicy::follow())
        .call()
        .expect("redirected response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.final_uri(), "http://api.test/moved");
    assert_eq!(transport.captured().len(), 2);
}

#[test]
fn disabled_redirects_surface_the_3xx_response_unchanged() {
    let (dispatcher, transport) = dispatcher_with(
        DispatcherConfig::default().with_redirect_policy(RedirectPolicy::follow()),
        vec![Script::redirect(302, "http://api.test/moved")],
    );

    let response = dispatcher
        .get("http://api.test/start")
        .redirect_policy(RedirectPolicy::none())
        .call()
        .expect("the 302 itself is the terminal response");

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(transport.captured().len(), 1);
}

#[derive(Default)]
struct CountingObserver {
    hops: AtomicU64,
    drains: AtomicU64,
    last_elapsed_ms: AtomicU64,
}

impl DispatchObserver for CountingObserver {
    fn on_hop_start(&self, _method: &Method, _uri: &str) {
        self.hops.fetch_add(1, Ordering::SeqCst);
    }

    fn on_drain(&self, _method: &Method, _uri: &str, elapsed: Duration) {
        self.drains.fetch_add(1, Ordering::SeqCst);
        self.last_elapsed_ms
            .store(elapsed.as_millis() as u64, Ordering::SeqCst);
    }
}

#[test]
fn observer_sees_every_hop_and_one_drain_for_buffered_bodies() {
    let observer = Arc::new(CountingObserver::default());
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default()
            .with_redirect_policy(RedirectPolicy::follow())
            .with_observer(Arc::clone(&observer) as Arc<dyn DispatchObserver>),
        vec![
            Script::redirect(302, "http://api.test/moved"),
            Script::ok(200, "done"),
        ],
    );

    dispatcher
        .get("http://api.test/start")
        .call()
        .expect("redirected response");

    assert_eq!(observer.hops.load(Ordering::SeqCst), 2);
    assert_eq!(observer.drains.load(Ordering::SeqCst), 1);
}

#[test]
fn observer_drain_fires_when_a_streamed_body_is_consumed() {
    let observer = Arc::new(CountingObserver::default());
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default()
            .with_observer(Arc::clone(&observer) as Arc<dyn DispatchObserver>),
        vec![Script::ok(200, "streamed")],
    );

    let response = dispatcher
        .get("http://api.test/stream")
        .streaming()
        .call()
        .expect("streaming response");
    assert_eq!(observer.drains.load(Ordering::SeqCst), 0);

    let stream = response.stream().expect("streaming body");
    let body = stream.read_to_bytes().expect("drained body");
    assert_eq!(body, Bytes::from_static(b"streamed"));
    assert_eq!(observer.drains.load(Ordering::SeqCst), 1);
}

#[test]
fn metrics_count_requests_redirects_and_statuses() {
    let (dispatcher, _transport) = dispatcher_with(
        DispatcherConfig::default()
            .with_redirect_policy(RedirectPolicy::follow())
            .with_metrics_enabled(true),
        vec![
            Script::redirect(302, "http://api.test/moved"),
            Script::ok(200, "done"),
            Script::Fail(Error::Transport {
                kind: TransportErrorKind::Connect,
                method: Method::GET,
                uri: "http://api.test/down".to_owned(),
                source: Arc::new(std::io::Error::other("refused")),
            }),
        ],
    );

    dispatcher
        .get("http://api.test/start")
        .call()
        .expect("redirected response");
    dispatcher
        .get("http://api.test/down")
        .call()
        .expect_err("transport fault");

    let snapshot = dispatcher.metrics_snapshot();
    assert_eq!(snapshot.requests_started, 2);
    assert_eq!(snapshot.requests_succeeded, 1);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.redirects_followed, 1);
    assert_eq!(snapshot.transport_errors, 1);
    assert_eq!(snapshot.status_counts.get(&200), Some(&1));
    assert_eq!(snapshot.error_counts.get("transport:connect"), Some(&1));
    assert_eq!(snapshot.in_flight, 0);
}
