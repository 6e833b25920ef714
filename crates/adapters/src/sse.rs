use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use storyloom_core::model::ChunkCallback;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::throttle::Throttle;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// Splits a byte stream into text lines. Bytes are held back until a newline
/// arrives, so multi-byte characters split across reads decode intact.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn parse_event_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == DONE_MARKER {
        return SseEvent::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|choice| choice.delta.and_then(|delta| delta.content))
                .collect();
            if text.is_empty() {
                SseEvent::Skip
            } else {
                SseEvent::Delta(text)
            }
        }
        Err(err) => {
            log::debug!("skipping malformed stream fragment: {err}");
            SseEvent::Skip
        }
    }
}

/// Reads an event stream to its end (or `[DONE]`), forwarding throttled
/// increments to `on_chunk`, then calls it once more with an empty increment
/// and the complete text.
pub(crate) async fn consume_event_stream<S, B, E>(
    stream: S,
    on_chunk: Option<ChunkCallback<'_>>,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<String, AdapterError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<AdapterError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = LineDecoder::default();
    let mut throttle = Throttle::new(interval);
    let mut full_text = String::new();
    let mut finished = false;

    while !finished {
        let deadline = throttle.deadline();
        tokio::select! {
            _ = cancel.cancelled() => {
                throttle.finish();
                return Err(AdapterError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let (Some(callback), Some(increment)) = (on_chunk, throttle.fire(Instant::now())) {
                    callback(&increment, &full_text);
                }
            }
            next = stream.next() => match next {
                Some(Ok(bytes)) => {
                    for line in decoder.push(bytes.as_ref()) {
                        if apply_line(&line, &mut full_text, &mut throttle, on_chunk) {
                            finished = true;
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    throttle.finish();
                    return Err(err.into());
                }
                None => {
                    if let Some(line) = decoder.finish() {
                        apply_line(&line, &mut full_text, &mut throttle, on_chunk);
                    }
                    finished = true;
                }
            }
        }
    }

    throttle.finish();
    if let Some(callback) = on_chunk {
        callback("", &full_text);
    }
    Ok(full_text)
}

/// Returns `true` once the end-of-stream marker is seen.
fn apply_line(
    line: &str,
    full_text: &mut String,
    throttle: &mut Throttle,
    on_chunk: Option<ChunkCallback<'_>>,
) -> bool {
    match parse_event_line(line) {
        SseEvent::Done => true,
        SseEvent::Skip => false,
        SseEvent::Delta(text) => {
            full_text.push_str(&text);
            if let Some(callback) = on_chunk {
                if let Some(increment) = throttle.push(&text, Instant::now()) {
                    callback(&increment, full_text);
                }
            }
            false
        }
    }
}
