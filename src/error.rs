use std::sync::Arc;

use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeForm,
    Deserialize,
    Transport,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    TooManyRedirects,
    AlreadyDelivered,
    Interrupted,
    Callback,
    TlsConfig,
    PoolClosed,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeForm => "serialize_form",
            Self::Deserialize => "deserialize",
            Self::Transport => "transport",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::TooManyRedirects => "too_many_redirects",
            Self::AlreadyDelivered => "already_delivered",
            Self::Interrupted => "interrupted",
            Self::Callback => "callback",
            Self::TlsConfig => "tls_config",
            Self::PoolClosed => "pool_closed",
        }
    }
}

/// Errors are `Clone` so one failure can live inside a delivered
/// [`ResponseEnvelope`](crate::ResponseEnvelope) and still be re-raised by
/// every blocking caller; non-cloneable sources are shared through `Arc`.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("too many redirects ({max_redirects}) for {method} {uri}")]
    TooManyRedirects {
        max_redirects: usize,
        method: Method,
        uri: String,
        visited: Vec<String>,
    },
    #[error("promise was already delivered")]
    AlreadyDelivered,
    #[error("wait was interrupted before a value was delivered")]
    Interrupted,
    #[error("response transform failed: {message}")]
    Callback { message: String },
    #[error("invalid tls configuration for backend {backend}: {message}")]
    TlsConfig {
        backend: &'static str,
        message: String,
    },
    #[error("dispatcher worker pool is closed")]
    PoolClosed,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::AlreadyDelivered => ErrorCode::AlreadyDelivered,
            Self::Interrupted => ErrorCode::Interrupted,
            Self::Callback { .. } => ErrorCode::Callback,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::PoolClosed => ErrorCode::PoolClosed,
        }
    }

    pub(crate) fn transport(
        kind: TransportErrorKind,
        method: &Method,
        uri: &str,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            kind,
            method: method.clone(),
            uri: uri.to_owned(),
            source: Arc::from(source.into()),
        }
    }
}
