use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, LOCATION};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::Error;
use crate::util::same_origin;

/// `X-Authorization` carries bearer material in several SDK conventions and
/// is stripped under the same rules as `Authorization`.
const X_AUTHORIZATION: HeaderName = HeaderName::from_static("x-authorization");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(10)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// One hop's worth of state fed to [`evaluate`].
#[derive(Debug)]
pub(crate) struct RedirectContext<'a> {
    pub(crate) status: StatusCode,
    pub(crate) method: &'a Method,
    pub(crate) current_uri: &'a Uri,
    pub(crate) headers: &'a HeaderMap,
    pub(crate) response_headers: &'a HeaderMap,
    pub(crate) trace: &'a [Uri],
    pub(crate) policy: RedirectPolicy,
    pub(crate) force_method: bool,
    pub(crate) redacted_uri: &'a str,
}

/// The follow-up request produced by an accepted hop.
#[derive(Debug)]
pub(crate) struct NextHop {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) enum RedirectDecision {
    /// Issue another network attempt with the rewritten request.
    Follow(NextHop),
    /// The response is terminal; hand it to the caller as-is.
    Stop,
    /// The chain failed; no further hop is attempted.
    Fail(Error),
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Method rewrite rules. 303 rewrites to GET unconditionally; the force flag
/// only preserves the method across 301/302, and 307/308 always preserve it.
pub(crate) fn redirect_method(method: &Method, status: StatusCode, force_method: bool) -> Method {
    match status {
        StatusCode::SEE_OTHER if *method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if !force_method => {
            if matches!(*method, Method::GET | Method::HEAD) {
                method.clone()
            } else {
                Method::GET
            }
        }
        _ => method.clone(),
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    // A hop may never leave http(s); the initial URI was validated the same
    // way.
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.as_str().parse().ok()
}

/// Drops credential headers when the follow-up request no longer matches the
/// caller's intent: a rewritten method or a cross-origin target must not see
/// `Authorization`/`X-Authorization`, and cookies never cross origins. A
/// method rewrite also drops the body framing headers.
pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    method_changed: bool,
    same_origin_redirect: bool,
) {
    if method_changed {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if method_changed || !same_origin_redirect {
        headers.remove(AUTHORIZATION);
        headers.remove(X_AUTHORIZATION);
    }
    if !same_origin_redirect {
        headers.remove(COOKIE);
    }
}

/// Classifies one terminal status. Evaluated once per hop; a fresh network
/// attempt for an accepted hop is always issued by the dispatcher.
pub(crate) fn evaluate(context: RedirectContext<'_>) -> RedirectDecision {
    if !context.policy.enabled() || !is_redirect_status(context.status) {
        return RedirectDecision::Stop;
    }

    if context.trace.len() >= context.policy.max_redirects() {
        return RedirectDecision::Fail(Error::TooManyRedirects {
            max_redirects: context.policy.max_redirects(),
            method: context.method.clone(),
            uri: context.redacted_uri.to_owned(),
            visited: context
                .trace
                .iter()
                .map(|uri| crate::util::redact_uri_for_logs(&uri.to_string()))
                .collect(),
        });
    }

    let Some(location) = redirect_location(context.response_headers) else {
        return RedirectDecision::Fail(Error::MissingRedirectLocation {
            status: context.status.as_u16(),
            method: context.method.clone(),
            uri: context.redacted_uri.to_owned(),
        });
    };
    let Some(next_uri) = resolve_redirect_uri(context.current_uri, &location) else {
        return RedirectDecision::Fail(Error::InvalidRedirectLocation {
            location,
            method: context.method.clone(),
            uri: context.redacted_uri.to_owned(),
        });
    };

    let next_method = redirect_method(context.method, context.status, context.force_method);
    let method_changed = next_method != *context.method;
    let same_origin_redirect = same_origin(context.current_uri, &next_uri);

    let mut next_headers = context.headers.clone();
    sanitize_headers_for_redirect(&mut next_headers, method_changed, same_origin_redirect);

    RedirectDecision::Follow(NextHop {
        method: next_method,
        uri: next_uri,
        headers: next_headers,
    })
}
