use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};

use bytes::{Buf, Bytes};
use http::{HeaderMap, Method, StatusCode};
use tracing::warn;

use crate::error::{Error, TransportErrorKind};
use crate::util::lock_unpoisoned;

/// First event of a hop: status line and headers, published before the body
/// has finished arriving.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Clone, Debug)]
pub(crate) enum StreamOutcome {
    Completed,
    Failed(Error),
}

/// Single-write slot recording how the transfer ultimately ended. Written by
/// the transport thread, consulted by the consumer only at end-of-stream or
/// close.
#[derive(Debug, Default)]
pub(crate) struct OutcomeCell {
    slot: Mutex<Option<StreamOutcome>>,
}

impl OutcomeCell {
    pub(crate) fn set_once(&self, outcome: StreamOutcome) -> bool {
        let mut slot = lock_unpoisoned(&self.slot);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    pub(crate) fn get(&self) -> Option<StreamOutcome> {
        lock_unpoisoned(&self.slot).clone()
    }
}

/// Push side handed to the transport for one hop.
///
/// Events arrive in transport order: `headers` once, then any number of
/// `body_chunk` calls, then exactly one terminal `complete` or `error`.
/// Chunk pushes block once the relay buffer is full, so a slow consumer
/// applies backpressure to the delivery thread instead of queuing unbounded
/// memory.
pub struct EventSink {
    method: Method,
    uri: String,
    head_tx: Option<SyncSender<ResponseHead>>,
    chunk_tx: Option<SyncSender<Bytes>>,
    outcome: Arc<OutcomeCell>,
    terminated: bool,
}

impl EventSink {
    pub fn headers(&mut self, status: StatusCode, headers: HeaderMap) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(ResponseHead { status, headers });
        }
    }

    /// Relays one body chunk. Returns `false` when the consumer closed the
    /// stream and the transport should stop reading; that is a deliberate
    /// abandonment, not a fault.
    pub fn body_chunk(&mut self, chunk: Bytes) -> bool {
        let Some(chunk_tx) = &self.chunk_tx else {
            return false;
        };
        if chunk_tx.send(chunk).is_ok() {
            return true;
        }
        self.outcome.set_once(StreamOutcome::Completed);
        self.terminated = true;
        self.head_tx = None;
        self.chunk_tx = None;
        false
    }

    pub fn complete(mut self) {
        self.finish(StreamOutcome::Completed);
    }

    pub fn error(mut self, fault: Error) {
        self.finish(StreamOutcome::Failed(fault));
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if !self.terminated && !self.outcome.set_once(outcome) {
            warn!(uri = %self.uri, "transport reported a second terminal event; keeping the first");
        }
        self.terminated = true;
        self.head_tx = None;
        self.chunk_tx = None;
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if !self.terminated {
            let fault = Error::transport(
                TransportErrorKind::Other,
                &self.method,
                &self.uri,
                "transport dropped the request without a terminal event",
            );
            self.outcome.set_once(StreamOutcome::Failed(fault));
            self.head_tx = None;
            self.chunk_tx = None;
        }
    }
}

/// Pull side of the relay: a live, sequential, single-consumer byte source.
///
/// Reads return body bytes in transport order and block while none are
/// buffered. A transport fault recorded in the outcome cell is raised on the
/// read that would otherwise signal end-of-stream, never earlier: bytes
/// received are not proof the transfer succeeded until end-of-stream has been
/// checked.
pub struct BodyStream {
    chunk_rx: Option<Receiver<Bytes>>,
    outcome: Arc<OutcomeCell>,
    current: Bytes,
    drained: bool,
    drain_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BodyStream")
            .field("buffered", &self.current.len())
            .field("drained", &self.drained)
            .finish()
    }
}

impl BodyStream {
    /// Fires once, when the stream reaches end-of-stream or is closed. Used
    /// for drain-time observation hooks.
    pub(crate) fn set_drain_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.drain_hook = Some(Box::new(hook));
    }

    fn mark_drained(&mut self) {
        self.drained = true;
        if let Some(hook) = self.drain_hook.take() {
            hook();
        }
    }

    /// Reads the next chunk of body bytes into `buffer`. `Ok(0)` is
    /// end-of-stream; a deferred transport fault is returned instead of
    /// `Ok(0)` when the transfer failed after emitting a prefix of bytes.
    pub fn read_chunk(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        if buffer.is_empty() {
            return Ok(0);
        }

        if self.current.is_empty() && !self.drained {
            match &self.chunk_rx {
                Some(chunk_rx) => match chunk_rx.recv() {
                    Ok(chunk) => self.current = chunk,
                    Err(_) => self.mark_drained(),
                },
                None => self.mark_drained(),
            }
        }

        if !self.current.is_empty() {
            let take = self.current.len().min(buffer.len());
            buffer[..take].copy_from_slice(&self.current[..take]);
            self.current.advance(take);
            return Ok(take);
        }

        match self.outcome.get() {
            Some(StreamOutcome::Failed(fault)) => Err(fault),
            _ => Ok(0),
        }
    }

    /// Releases the relay without draining the remaining body.
    ///
    /// Queued events are discarded, a transport thread blocked on a full
    /// relay buffer is unblocked, and a fault already recorded in the outcome
    /// cell is still surfaced rather than lost.
    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(chunk_rx) = self.chunk_rx.take() {
            loop {
                match chunk_rx.try_recv() {
                    Ok(_) => continue,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        self.current = Bytes::new();
        self.mark_drained();

        match self.outcome.get() {
            Some(StreamOutcome::Failed(fault)) => Err(fault),
            _ => Ok(()),
        }
    }

    /// Drains the stream to completion, enforcing the deferred-fault check.
    pub fn read_to_bytes(&mut self) -> Result<Bytes, Error> {
        let mut collected = Vec::new();
        let mut chunk = [0_u8; 8192];
        loop {
            let read = self.read_chunk(&mut chunk)?;
            if read == 0 {
                return Ok(Bytes::from(collected));
            }
            collected.extend_from_slice(&chunk[..read]);
        }
    }
}

impl Read for BodyStream {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.read_chunk(buffer).map_err(std::io::Error::other)
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        // Abandoning the handle must not leave the transport blocked on a
        // full relay buffer.
        let _ = self.close();
    }
}

/// Builds the relay for one hop: the transport's push side, the headers
/// notification, and the consumer's pull side. `capacity` bounds the number
/// of in-flight chunks between the two threads.
pub(crate) fn channel(
    method: &Method,
    uri: &str,
    capacity: usize,
) -> (EventSink, Receiver<ResponseHead>, BodyStream) {
    let (head_tx, head_rx) = sync_channel(1);
    let (chunk_tx, chunk_rx) = sync_channel(capacity.max(1));
    let outcome = Arc::new(OutcomeCell::default());

    let sink = EventSink {
        method: method.clone(),
        uri: uri.to_owned(),
        head_tx: Some(head_tx),
        chunk_tx: Some(chunk_tx),
        outcome: Arc::clone(&outcome),
        terminated: false,
    };
    let stream = BodyStream {
        chunk_rx: Some(chunk_rx),
        outcome,
        current: Bytes::new(),
        drained: false,
        drain_hook: None,
    };
    (sink, head_rx, stream)
}
