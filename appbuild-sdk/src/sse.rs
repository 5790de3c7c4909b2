//! Server-sent event decoding.
//!
//! The agent streams blank-line terminated frames:
//!
//! ```text
//! event: message
//! data: {"status":"running","traceId":"app-1.req-1","message":{...}}
//!
//! event: done
//! data:
//! ```
//!
//! [`FrameParser`] turns lines into [`Frame`]s. [`SseDecoder::parse`] drives
//! it over an `AsyncBufRead`, handles the `done`, `error` and `debug`
//! control events itself, and hands every other frame to a
//! [`StreamHandler`] as a typed [`AgentEvent`].
//!
//! A bad frame is logged to the debug sink and skipped. Only the `error`
//! control event and transport failures end the stream with an error.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::conversation::CorrelationError;
use crate::debug::{DebugSink, LogLevel};
use crate::event::{AgentEvent, SchemaError};
use crate::trace::TraceId;

/// Name of a frame that has an `id:` but no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl Frame {
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT)
    }

    /// The decoded `data` field. See [`decode_payload`].
    pub fn payload(&self) -> Value {
        decode_payload(&self.data)
    }
}

/// JSON-decode a data field, never failing.
///
/// A payload that decodes to a JSON string is decoded once more, since the
/// backend re-serializes agent output. Anything that is not JSON is kept as
/// the raw string.
pub fn decode_payload(data: &str) -> Value {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(v) => v,
            Err(_) => Value::String(inner),
        },
        Ok(v) => v,
        Err(_) => Value::String(data.to_string()),
    }
}

/// Accumulates lines until a blank line closes the frame.
#[derive(Debug, Default)]
pub struct FrameParser {
    lines: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without its line terminator).
    ///
    /// Returns a frame when the line is blank and the buffered lines start
    /// with an `event:` or `id:` field. Buffers that start with anything
    /// else are dropped.
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            let lines = std::mem::take(&mut self.lines);
            return build_frame(&lines);
        }
        // Comment line.
        if line.starts_with(':') {
            return None;
        }
        self.lines.push(line.to_string());
        None
    }

    /// Whether a partial frame is buffered.
    pub fn has_pending(&self) -> bool {
        !self.lines.is_empty()
    }
}

fn build_frame(lines: &[String]) -> Option<Frame> {
    let first = lines.first()?;
    if !(first.starts_with("event:") || first.starts_with("id:")) {
        return None;
    }

    let mut frame = Frame::default();
    let mut data = Vec::new();
    for line in lines {
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.trim()),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => frame.id = Some(value.to_string()),
            "retry" => frame.retry = value.parse().ok(),
            _ => {}
        }
    }
    frame.data = data.join("\n");
    Some(frame)
}

/// How a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server sent `done`.
    Done,
    /// The server closed the stream.
    Closed,
    /// The caller cancelled the stream.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The connection failed, timed out or was reset.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The server sent an `error` event.
    #[error("agent stream error: {message}")]
    Protocol {
        message: String,
        trace_id: Option<TraceId>,
    },
    /// A single frame could not be decoded. The stream continues.
    #[error("undecodable `{event}` frame: {source}")]
    Decode {
        event: String,
        #[source]
        source: SchemaError,
    },
    /// An event could not be filed. The stream continues.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

impl StreamError {
    /// Whether this error ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::Transport(_) | StreamError::Protocol { .. })
    }
}

/// Callbacks for [`SseDecoder::parse`].
pub trait StreamHandler {
    /// Called once per valid event, in arrival order. A rejected event is
    /// reported through [`StreamHandler::on_error`] and does not stop the
    /// stream.
    fn on_message(&mut self, event: AgentEvent) -> Result<(), CorrelationError>;

    /// Non-fatal event errors, and the terminal error if the stream fails.
    fn on_error(&mut self, _error: &StreamError) {}

    /// Every dispatched frame, control events included.
    fn on_event(&mut self, _frame: &Frame) {}

    /// Called exactly once when parsing stops, however it stops.
    fn on_close(&mut self) {}
}

/// Reads one SSE stream to completion.
pub struct SseDecoder {
    sink: Arc<dyn DebugSink>,
    cancel: CancellationToken,
}

impl SseDecoder {
    pub fn new(sink: Arc<dyn DebugSink>) -> Self {
        Self {
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A token that stops [`SseDecoder::parse`] when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Parse `reader` until `done`, `error`, end of stream, a transport
    /// failure or cancellation. No frame is handled after any of these.
    pub async fn parse<R, H>(&self, reader: R, handler: &mut H) -> Result<StreamEnd, StreamError>
    where
        R: AsyncBufRead + Unpin,
        H: StreamHandler + ?Sized,
    {
        let result = self.run(reader, handler).await;
        match &result {
            Ok(end) => tracing::debug!(?end, "agent stream finished"),
            Err(e) => {
                tracing::warn!(error = %e, "agent stream failed");
                handler.on_error(e);
            }
        }
        handler.on_close();
        result
    }

    async fn run<R, H>(&self, mut reader: R, handler: &mut H) -> Result<StreamEnd, StreamError>
    where
        R: AsyncBufRead + Unpin,
        H: StreamHandler + ?Sized,
    {
        let mut parser = FrameParser::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                read = reader.read_until(b'\n', &mut line) => read?,
            };
            if n == 0 {
                if parser.has_pending() {
                    tracing::debug!("stream closed with an unterminated frame");
                }
                return Ok(StreamEnd::Closed);
            }

            let Some(frame) = parser.push_line(&String::from_utf8_lossy(&line)) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            handler.on_event(&frame);
            match frame.name() {
                "done" => return Ok(StreamEnd::Done),
                "error" => return Err(protocol_error(&frame)),
                "debug" => self.forward_debug(&frame),
                name => self.dispatch(name, &frame, handler),
            }
        }
    }

    fn dispatch<H>(&self, name: &str, frame: &Frame, handler: &mut H)
    where
        H: StreamHandler + ?Sized,
    {
        match AgentEvent::from_value(frame.payload()) {
            Ok(event) => {
                tracing::trace!(
                    trace_id = %event.trace_id,
                    kind = %event.kind(),
                    status = event.status.as_str(),
                    "agent event"
                );
                if let Err(e) = handler.on_message(event) {
                    let e = StreamError::from(e);
                    tracing::debug!(error = %e, "agent event rejected");
                    self.sink.log(&e.to_string(), LogLevel::Error);
                    handler.on_error(&e);
                }
            }
            Err(source) => {
                let e = StreamError::Decode {
                    event: name.to_string(),
                    source,
                };
                tracing::debug!(error = %e, data = %frame.data, "skipping frame");
                self.sink.log(&format!("{e}: {}", frame.data), LogLevel::Error);
            }
        }
    }

    fn forward_debug(&self, frame: &Frame) {
        match frame.payload() {
            Value::Object(obj) => {
                let message = match obj.get("log") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => Value::Object(obj.clone()).to_string(),
                };
                let level = LogLevel::from_wire(obj.get("level").and_then(Value::as_str));
                self.sink.log(&message, level);
            }
            Value::String(s) => self.sink.log(&s, LogLevel::Info),
            other => self.sink.log(&other.to_string(), LogLevel::Info),
        }
    }
}

fn protocol_error(frame: &Frame) -> StreamError {
    let payload = frame.payload();
    let message = match &payload {
        Value::Object(obj) => match obj.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => payload.to_string(),
        },
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => "unknown error".to_string(),
    };
    let trace_id = payload
        .get("traceId")
        .and_then(Value::as_str)
        .map(TraceId::from);
    StreamError::Protocol { message, trace_id }
}
