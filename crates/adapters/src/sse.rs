use std::collections::VecDeque;

use ebook_core::{LanguageModelError, TextStream};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::AdapterError;

/// What a backend-specific parser made of one `data:` payload.
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Text(String),
    Skip,
    Done,
    Error(String),
}

pub(crate) type EventParser = fn(&str) -> SseEvent;

/// Splits a byte stream into server-sent-event `data:` payloads.
/// Lines may arrive split across chunks, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    payloads.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        payloads
    }

    /// Payload still pending when the connection closed without a blank line.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(value) = rest.trim_end().strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
        }
        if self.data.is_empty() {
            None
        } else {
            let payload = self.data.join("\n");
            self.data.clear();
            Some(payload)
        }
    }
}

struct StreamState {
    bytes: BoxStream<'static, Result<Vec<u8>, AdapterError>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    parse: EventParser,
    finished: bool,
}

impl StreamState {
    /// Feeds payloads to the parser; `Err` ends the stream.
    fn absorb(&mut self, payloads: Vec<String>) -> Result<(), AdapterError> {
        for payload in payloads {
            match (self.parse)(&payload) {
                SseEvent::Text(text) if !text.is_empty() => self.pending.push_back(text),
                SseEvent::Text(_) | SseEvent::Skip => {}
                SseEvent::Done => {
                    self.finished = true;
                    break;
                }
                SseEvent::Error(message) => return Err(AdapterError::Stream(message)),
            }
        }
        Ok(())
    }
}

/// Turns an SSE response body into text chunks using a backend-specific parser.
pub(crate) fn text_stream(response: reqwest::Response, parse: EventParser) -> TextStream {
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(AdapterError::Http));
    decode_events(bytes, parse)
}

fn decode_events<S>(bytes: S, parse: EventParser) -> TextStream
where
    S: Stream<Item = Result<Vec<u8>, AdapterError>> + Send + 'static,
{
    let state = StreamState {
        bytes: bytes.boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        parse,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.finished {
                return None;
            }
            let outcome = match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = state.decoder.push(&chunk);
                    state.absorb(payloads)
                }
                Some(Err(err)) => Err(err),
                None => {
                    state.finished = true;
                    let payloads = state.decoder.finish().into_iter().collect();
                    state.absorb(payloads)
                }
            };
            if let Err(err) = outcome {
                state.finished = true;
                state.pending.clear();
                return Some((Err(LanguageModelError::from(err)), state));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\n\n"), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn decoder_ignores_comments_and_event_names() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.push(
            b": keep-alive\nevent: content_block_delta\ndata: first\n\ndata: [DONE]\n\n",
        );
        assert_eq!(payloads, vec!["first".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn decoder_handles_crlf_and_multibyte_boundaries() {
        let mut decoder = SseDecoder::default();
        let text = "data: caf\u{e9}\r\n\r\n".as_bytes();
        let (head, tail) = text.split_at(10);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["caf\u{e9}".to_string()]);
    }

    fn words(payload: &str) -> SseEvent {
        match payload {
            "[DONE]" => SseEvent::Done,
            "boom" => SseEvent::Error("exploded".into()),
            other => SseEvent::Text(other.to_string()),
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, AdapterError>> {
        let parts: Vec<Result<Vec<u8>, AdapterError>> =
            parts.iter().map(|part| Ok(part.as_bytes().to_vec())).collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn events_become_text_chunks_until_done() {
        let collected: Vec<_> = decode_events(
            chunks(&["data: one\n\ndata: tw", "o\n\ndata: [DONE]\n\ndata: ignored\n\n"]),
            words,
        )
        .collect()
        .await;
        let texts: Vec<String> = collected.into_iter().filter_map(Result::ok).collect();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn stream_error_ends_the_stream() {
        let collected: Vec<_> = decode_events(
            chunks(&["data: one\n\ndata: boom\n\ndata: later\n\n"]),
            words,
        )
        .collect()
        .await;
        assert_eq!(collected.len(), 1);
        let err = match collected.into_iter().next() {
            Some(Err(err)) => err,
            other => panic!("expected a stream error, got {other:?}"),
        };
        assert_eq!(
            err.kind(),
            ebook_core::LanguageModelErrorKind::InvalidResponse
        );
    }

    #[test]
    fn decoder_flushes_unterminated_payload() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }
}
