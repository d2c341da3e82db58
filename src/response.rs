use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::relay::BodyStream;
use crate::util::{lock_unpoisoned, truncate_body};

/// Shareable handle over a live body relay.
///
/// Cloning the handle shares the same underlying stream; reads are
/// sequential, so concurrent readers interleave chunks rather than each
/// seeing the full body.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    inner: Arc<Mutex<BodyStream>>,
}

impl StreamHandle {
    pub(crate) fn new(stream: BodyStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// See [`BodyStream::read_chunk`]: `Ok(0)` is end-of-stream, and a
    /// transport fault recorded mid-transfer is raised here instead.
    pub fn read_chunk(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        lock_unpoisoned(&self.inner).read_chunk(buffer)
    }

    /// Abandons the remaining body. Discards queued chunks, unblocks the
    /// delivery thread, and surfaces any fault already recorded.
    pub fn close(&self) -> Result<(), Error> {
        lock_unpoisoned(&self.inner).close()
    }

    /// Drains the stream into one buffer, enforcing the end-of-stream fault
    /// check.
    pub fn read_to_bytes(&self) -> Result<Bytes, Error> {
        lock_unpoisoned(&self.inner).read_to_bytes()
    }

    /// Copies the remaining body into `writer` in transport-sized chunks.
    pub fn copy_to_writer(&self, writer: &mut impl std::io::Write) -> Result<u64, Error> {
        let mut stream = lock_unpoisoned(&self.inner);
        let mut chunk = [0_u8; 8192];
        let mut copied = 0_u64;
        loop {
            let read = stream.read_chunk(&mut chunk)?;
            if read == 0 {
                return Ok(copied);
            }
            writer
                .write_all(&chunk[..read])
                .map_err(|source| Error::Callback {
                    message: format!("writer failed while copying response body: {source}"),
                })?;
            copied += read as u64;
        }
    }
}

#[derive(Clone, Debug)]
pub enum ResponseBody {
    /// Drained and decoded as UTF-8 text (lossy).
    Text(String),
    /// Drained raw bytes.
    Buffered(Bytes),
    /// Live relay handle; the body may still be in flight.
    Stream(StreamHandle),
}

/// Terminal response of a request chain. Any status is a valid response;
/// status-based policy belongs to the caller, not this layer.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    final_uri: String,
    redirect_trace: Vec<String>,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        final_uri: String,
        redirect_trace: Vec<String>,
        body: ResponseBody,
    ) -> Self {
        Self {
            status,
            headers,
            final_uri,
            redirect_trace,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URI that produced this response, after any redirects.
    pub fn final_uri(&self) -> &str {
        &self.final_uri
    }

    /// Redacted URIs visited before the final one, in order. Empty when the
    /// first attempt was terminal.
    pub fn redirect_trace(&self) -> &[String] {
        &self.redirect_trace
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// The body's original `content-encoding`, untouched: this layer never
    /// decodes response bodies.
    pub fn content_encoding(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// The streaming handle, when the request asked for a streamed body.
    pub fn stream(&self) -> Option<StreamHandle> {
        match &self.body {
            ResponseBody::Stream(handle) => Some(handle.clone()),
            ResponseBody::Text(_) | ResponseBody::Buffered(_) => None,
        }
    }

    /// Full body bytes. A streamed body is drained here, so the deferred
    /// fault check applies.
    pub fn bytes(&self) -> Result<Bytes, Error> {
        match &self.body {
            ResponseBody::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            ResponseBody::Buffered(bytes) => Ok(bytes.clone()),
            ResponseBody::Stream(handle) => handle.read_to_bytes(),
        }
    }

    pub fn text_lossy(&self) -> Result<String, Error> {
        match &self.body {
            ResponseBody::Text(text) => Ok(text.clone()),
            _ => Ok(String::from_utf8_lossy(&self.bytes()?).into_owned()),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let body = self.bytes()?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source: Arc::new(source),
            body: truncate_body(&body),
        })
    }
}

/// What the promise delivers: one immutable record of how the request ended.
///
/// The envelope is `Clone` so every waiter on the shared promise can take its
/// own copy; a failure is re-raised identically for each of them.
#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    outcome: Result<Response, Error>,
}

impl ResponseEnvelope {
    pub(crate) fn success(response: Response) -> Self {
        Self {
            outcome: Ok(response),
        }
    }

    pub(crate) fn failure(fault: Error) -> Self {
        Self {
            outcome: Err(fault),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn as_result(&self) -> Result<&Response, &Error> {
        self.outcome.as_ref()
    }

    pub fn into_result(self) -> Result<Response, Error> {
        self.outcome
    }

    /// Clones the outcome out of a shared envelope.
    pub fn to_result(&self) -> Result<Response, Error> {
        self.outcome.clone()
    }
}
