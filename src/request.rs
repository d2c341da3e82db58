use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::promise::Promise;
use crate::redirect::RedirectPolicy;
use crate::response::{Response, ResponseEnvelope};
use crate::tls::TlsMaterial;
use crate::util::{
    append_query_pairs, parse_header_name, parse_header_value, parse_request_uri,
    redact_uri_for_logs,
};

/// Requested response representation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyMode {
    /// Drain the body before delivering and decode it as UTF-8 text (lossy).
    Text,
    /// Drain the body before delivering; the envelope carries the raw bytes.
    #[default]
    Bytes,
    /// Deliver as soon as the final head arrives; the envelope carries a live
    /// stream handle.
    Stream,
}

/// Runs on the delivery thread after the terminal response is known and
/// before delivery. A panic inside the transform is caught and delivered as
/// [`Error::Callback`].
pub type ResponseTransform = Arc<dyn Fn(Response) -> Result<Response, Error> + Send + Sync>;

/// Fully resolved description of one request chain, as handed to the
/// dispatcher. Redirect hops derive follow-up descriptions from this one; the
/// caller's original is never mutated.
pub struct RequestDescription {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) body_mode: BodyMode,
    pub(crate) redirect_policy: Option<RedirectPolicy>,
    pub(crate) force_redirect_method: Option<bool>,
    pub(crate) tls: Option<TlsMaterial>,
    pub(crate) transform: Option<ResponseTransform>,
}

#[doc(hidden)]
pub struct RequestBuilder<'a> {
    dispatcher: &'a Dispatcher,
    method: Method,
    uri_text: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    body_mode: BodyMode,
    redirect_policy: Option<RedirectPolicy>,
    force_redirect_method: Option<bool>,
    tls: Option<TlsMaterial>,
    transform: Option<ResponseTransform>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, method: Method, uri_text: String) -> Self {
        Self {
            dispatcher,
            method,
            uri_text,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            body_mode: BodyMode::default(),
            redirect_policy: None,
            force_redirect_method: None,
            tls: None,
            transform: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeForm {
                source: Arc::new(source),
            })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn text(self, body: impl Into<String>) -> Self {
        self.body(Bytes::from(body.into())).header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
    }

    pub fn json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        Ok(self
            .body(Bytes::from(body))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(payload).map_err(|source| Error::SerializeForm {
                source: Arc::new(source),
            })?;
        Ok(self.body(Bytes::from(encoded)).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    /// Per-request override of the dispatcher's request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Per-request override of the dispatcher's redirect policy.
    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = Some(redirect_policy);
        self
    }

    /// Per-request override of the 301/302 method-preservation flag. 303
    /// still rewrites to GET regardless.
    pub fn force_redirect_method(mut self, force_redirect_method: bool) -> Self {
        self.force_redirect_method = Some(force_redirect_method);
        self
    }

    /// Per-request TLS material override; the transport builds a dedicated
    /// agent for it.
    pub fn tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn body_mode(mut self, body_mode: BodyMode) -> Self {
        self.body_mode = body_mode;
        self
    }

    /// Deliver the response as soon as the final head arrives; the body is
    /// read through a [`StreamHandle`](crate::StreamHandle).
    pub fn streaming(self) -> Self {
        self.body_mode(BodyMode::Stream)
    }

    /// Registers a transform applied to the terminal response on the delivery
    /// thread before the promise is completed.
    pub fn transform(
        mut self,
        transform: impl Fn(Response) -> Result<Response, Error> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    fn build(self) -> Result<(&'a Dispatcher, RequestDescription), Error> {
        let uri_text = append_query_pairs(&self.uri_text, &self.query_pairs);
        let uri = parse_request_uri(&uri_text)?;
        Ok((
            self.dispatcher,
            RequestDescription {
                method: self.method,
                uri,
                headers: self.headers,
                body: self.body,
                timeout: self.timeout,
                body_mode: self.body_mode,
                redirect_policy: self.redirect_policy,
                force_redirect_method: self.force_redirect_method,
                tls: self.tls,
                transform: self.transform,
            },
        ))
    }

    /// Hands the request to the dispatcher and returns the promise for its
    /// eventual outcome. The calling thread never blocks here.
    pub fn dispatch(self) -> Result<Promise<ResponseEnvelope>, Error> {
        let (dispatcher, description) = self.build()?;
        dispatcher.dispatch(description)
    }

    /// Dispatches and blocks until the chain ends, returning the terminal
    /// response or logging and re-raising the recorded fault.
    pub fn call(self) -> Result<Response, Error> {
        let (dispatcher, description) = self.build()?;
        let method = description.method.clone();
        let redacted = redact_uri_for_logs(&description.uri.to_string());
        let promise = dispatcher.dispatch(description)?;
        let outcome = promise.wait().and_then(|envelope| envelope.to_result());
        if let Err(fault) = &outcome {
            warn!(
                method = %method,
                uri = %redacted,
                code = fault.code().as_str(),
                "request chain failed"
            );
        }
        outcome
    }
}
