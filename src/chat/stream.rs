use anyhow::Result;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::debug;

use super::events::StreamEvent;

/// Prefix marking an event line; anything else is keep-alive/comment noise.
pub const EVENT_PREFIX: &str = "data: ";
/// Literal terminator payload ending the stream.
pub const DONE_TOKEN: &str = "[DONE]";

/// Decoder for the chat endpoint's line-delimited event stream.
///
/// Reads binary chunks off the response body, splits on newlines (carrying
/// partial lines across chunk boundaries), strips the `data: ` prefix and
/// JSON-parses the remainder. Malformed JSON and unprefixed lines are
/// silently discarded. The stream is finite (it ends at the `[DONE]`
/// terminator or when the transport closes) and tied to one request body,
/// so it is not restartable.
pub struct SseDecoder<S> {
    stream: S,
    /// Raw bytes; a multi-byte character may straddle chunks, so decoding
    /// happens per complete line, never per chunk.
    buf: BytesMut,
    done: bool,
}

impl<S, E> SseDecoder<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            done: false,
        }
    }

    /// Next decoded event, or `Ok(None)` at end of stream. A transport
    /// error ends the stream after being reported once.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&raw);
                if let Some(event) = self.decode_line(line.trim_end_matches(['\r', '\n'])) {
                    return Ok(Some(event));
                }
                continue;
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    return Err(anyhow::Error::new(e).context("chat stream transport error"));
                }
                None => {
                    self.done = true;
                    // Flush a trailing line the transport closed without
                    // terminating.
                    let raw = self.buf.split();
                    let rest = String::from_utf8_lossy(&raw);
                    let rest = rest.trim_end_matches(['\r', '\n']);
                    if !rest.is_empty() {
                        if let Some(event) = self.decode_line(rest) {
                            return Ok(Some(event));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        let payload = line.strip_prefix(EVENT_PREFIX)?;
        if payload == DONE_TOKEN {
            self.done = true;
            return None;
        }
        match serde_json::from_str(payload) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("dropping malformed event line: {}", e);
                None
            }
        }
    }

    /// Adapt the decoder into a `Stream` of events. After yielding an
    /// error item the stream terminates.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent>> {
        futures::stream::unfold(self, |mut decoder| async move {
            match decoder.next_event().await {
                Ok(Some(event)) => Some((Ok(event), decoder)),
                Ok(None) => None,
                Err(e) => Some((Err(e), decoder)),
            }
        })
    }
}
