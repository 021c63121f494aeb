//! Lazy event stream over a streaming HTTP response body.
//!
//! Wraps the raw byte stream plus the matching frame decoder. The sequence is
//! finite and non-restartable: after the terminal event (or a transport
//! error) `next` returns `None` forever.

use super::decode::{NdjsonDecoder, SseDecoder, StreamEvent};
use super::LlmError;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

enum Decoder {
    Ndjson(NdjsonDecoder),
    Sse(SseDecoder),
}

impl Decoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        match self {
            Decoder::Ndjson(d) => d.feed(chunk),
            Decoder::Sse(d) => d.feed(chunk),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Decoder::Ndjson(d) => d.is_finished(),
            Decoder::Sse(d) => d.is_finished(),
        }
    }

    fn content(&self) -> &str {
        match self {
            Decoder::Ndjson(d) => d.content(),
            Decoder::Sse(d) => d.content(),
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Incrementally decoded chat stream: one [`StreamEvent`] at a time.
pub struct ChatEventStream {
    bytes: ByteStream,
    decoder: Decoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl ChatEventStream {
    pub(crate) fn ndjson(res: reqwest::Response) -> Self {
        Self::new(res, Decoder::Ndjson(NdjsonDecoder::new()))
    }

    pub(crate) fn sse(res: reqwest::Response) -> Self {
        Self::new(res, Decoder::Sse(SseDecoder::new()))
    }

    fn new(res: reqwest::Response, decoder: Decoder) -> Self {
        Self {
            bytes: Box::pin(res.bytes_stream()),
            decoder,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Next decoded event, suspending on the underlying network read.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, LlmError>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                if matches!(ev, StreamEvent::Done { .. }) {
                    self.done = true;
                }
                return Some(Ok(ev));
            }
            if self.done {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.pending.extend(self.decoder.feed(&chunk));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(LlmError::Connectivity(e)));
                }
                None => {
                    self.done = true;
                    // Body ended without a terminal frame: surface whatever
                    // accumulated as the final event.
                    if !self.decoder.is_finished() && !self.decoder.content().is_empty() {
                        return Some(Ok(StreamEvent::Done {
                            content: self.decoder.content().to_string(),
                        }));
                    }
                    return None;
                }
            }
        }
    }
}
