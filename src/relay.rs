//! Upstream byte stream → caller SSE frames.
//!
//! [`StreamRelay`] is polled directly by the HTTP layer as the response body, so reading the
//! next upstream chunk and writing the next frame happen on the same task. When the caller
//! goes away the body is dropped, which drops the upstream connection with it.

use bytes::Bytes;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

use crate::envelope::{FrameEncoder, DONE_FRAME, KEEP_ALIVE_FRAME};
use crate::registry::UsageTicket;

const STREAM_ERROR_MESSAGE: &str = "Upstream stream failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Opened,
    Streaming,
    Completed,
    Aborted,
}

impl RelayState {
    fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 sequence in upstream stream")]
    Invalid,
    #[error("upstream stream ended inside a multi-byte character")]
    Truncated,
}

/// Incremental UTF-8 decoder. Incomplete trailing sequences wait for the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, chunk: &[u8]) -> Result<String, DecodeError> {
        self.carry.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => return Err(DecodeError::Invalid),
        };
        let text = std::str::from_utf8(&self.carry[..valid])
            .map(str::to_owned)
            .map_err(|_| DecodeError::Invalid)?;
        self.carry.drain(..valid);
        Ok(text)
    }

    pub fn finish(&mut self) -> Result<(), DecodeError> {
        if self.carry.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Truncated)
        }
    }
}

pub struct StreamRelay<S> {
    inner: S,
    state: RelayState,
    decoder: Utf8Decoder,
    encoder: FrameEncoder,
    pending: VecDeque<Bytes>,
    ticket: UsageTicket,
}

impl<S> StreamRelay<S>
where
    S: futures_util::stream::Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    pub fn new(inner: S, encoder: FrameEncoder, ticket: UsageTicket) -> Self {
        Self {
            inner,
            state: RelayState::Idle,
            decoder: Utf8Decoder::default(),
            encoder,
            pending: VecDeque::new(),
            ticket,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn complete(&mut self) {
        if let Some(frame) = self.encoder.finish() {
            self.pending.push_back(frame);
        }
        self.pending.push_back(Bytes::from_static(DONE_FRAME));
        self.state = RelayState::Completed;
        debug!("upstream stream completed");
    }

    fn abort(&mut self, reason: &str) {
        warn!(reason, "upstream stream aborted");
        self.pending.push_back(self.encoder.error(STREAM_ERROR_MESSAGE));
        self.pending.push_back(Bytes::from_static(DONE_FRAME));
        self.state = RelayState::Aborted;
    }
}

impl<S> futures_util::stream::Stream for StreamRelay<S>
where
    S: futures_util::stream::Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            match this.state {
                RelayState::Idle => {
                    this.state = RelayState::Opened;
                    return Poll::Ready(Some(Ok(Bytes::from_static(KEEP_ALIVE_FRAME))));
                }
                RelayState::Completed | RelayState::Aborted => {
                    // Sentinel already flushed: count the call, then close.
                    this.ticket.settle();
                    return Poll::Ready(None);
                }
                RelayState::Opened | RelayState::Streaming => {}
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.state = RelayState::Streaming;
                    match this.decoder.push(&chunk) {
                        Ok(text) if text.is_empty() => {}
                        Ok(text) => this.pending.push_back(this.encoder.delta(&text)),
                        Err(e) => this.abort(&e.to_string()),
                    }
                }
                Poll::Ready(Some(Err(e))) => this.abort(&e.to_string()),
                Poll::Ready(None) => match this.decoder.finish() {
                    Ok(()) => this.complete(),
                    Err(e) => this.abort(&e.to_string()),
                },
            }
        }
    }
}

impl<S> Drop for StreamRelay<S> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!(state = ?self.state, "caller disconnected before stream finished");
            self.state = RelayState::Aborted;
        }
        // The ticket settles when dropped if the stream never reached its end.
    }
}
