//! HTTP client for the agent backend.
//!
//! Sends a user message and decodes the streamed reply, or fetches an
//! application's stored history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::{ACCEPT, HeaderMap};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::conversation::Thread;
use crate::debug::{DebugSink, TracingSink};
use crate::event::{AgentEvent, AppPrompt};
use crate::sse::{SseDecoder, StreamEnd, StreamError, StreamHandler};
use crate::trace::TraceId;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:4444";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const CLIENT_SOURCE: &str = "cli";

/// Deployment target of the generated application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment `{other}`")),
        }
    }
}

/// Configuration for [`AgentClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL, without a trailing `/`.
    pub base_url: String,
    /// Bearer token, if the backend requires one.
    pub token: Option<String>,
    pub environment: Option<Environment>,
    /// Limit on a whole request, streamed body included.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SERVER.to_string(),
            token: None,
            environment: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A message to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMessage {
    pub message: String,
    pub application_id: Option<String>,
    pub trace_id: Option<TraceId>,
}

impl SendMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Continue an existing thread.
    pub fn on_thread(mut self, thread: &Thread) -> Self {
        self.application_id = Some(thread.application_id.clone());
        self.trace_id = Some(thread.trace_id.clone());
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody<'a> {
    message: &'a str,
    client_source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    application_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<Environment>,
}

/// Daily message quota reported with each reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLimit {
    pub limit: u64,
    pub remaining: u64,
    pub usage: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
}

impl MessageLimit {
    /// Read the `x-dailylimit-*` headers. `None` unless both the limit and
    /// the remaining count are present and numeric.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let number = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok());

        Some(Self {
            limit: number("x-dailylimit-limit")?,
            remaining: number("x-dailylimit-remaining")?,
            usage: number("x-dailylimit-usage"),
            reset: get("x-dailylimit-reset")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Result of a completed [`AgentClient::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub end: StreamEnd,
    pub limit: Option<MessageLimit>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ClientError {
    /// Whether the failure is a connection or HTTP problem rather than an
    /// error reported by the agent.
    pub fn is_transport(&self) -> bool {
        match self {
            ClientError::Http(_) | ClientError::Status { .. } => true,
            ClientError::Stream(e) => matches!(e, StreamError::Transport(_)),
        }
    }
}

pub struct AgentClient {
    config: ClientConfig,
    http: reqwest::Client,
    sink: Arc<dyn DebugSink>,
}

impl AgentClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            http,
            sink: Arc::new(TracingSink),
        })
    }

    /// Send debug events and decode diagnostics to `sink`.
    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// POST the message and return the streaming response once its status
    /// is known to be successful.
    pub async fn open_stream(&self, request: &SendMessage) -> Result<reqwest::Response, ClientError> {
        let body = MessageBody {
            message: &request.message,
            client_source: CLIENT_SOURCE,
            application_id: request.application_id.as_deref(),
            trace_id: request.trace_id.as_ref(),
            environment: self.config.environment,
        };
        tracing::info!(
            app_id = body.application_id.unwrap_or("<new>"),
            trace_id = body.trace_id.map(TraceId::as_str).unwrap_or("<new>"),
            "sending message"
        );

        let resp = self
            .authorize(self.http.post(self.url("/message")))
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        check_status(resp).await
    }

    /// Send a message and feed the reply stream to `handler` until it ends.
    ///
    /// Cancelling `cancel` stops the request, or the stream if it is already
    /// open, and returns [`StreamEnd::Cancelled`].
    pub async fn send_message<H>(
        &self,
        request: &SendMessage,
        handler: &mut H,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, ClientError>
    where
        H: StreamHandler + ?Sized,
    {
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(SendOutcome { end: StreamEnd::Cancelled, limit: None });
            }
            resp = self.open_stream(request) => resp?,
        };
        let limit = MessageLimit::from_headers(resp.headers());
        if let Some(limit) = &limit {
            tracing::debug!(remaining = limit.remaining, limit = limit.limit, "daily message limit");
        }

        let decoder = SseDecoder::new(self.sink.clone()).with_cancellation(cancel);
        let end = decoder.parse(body_reader(resp), handler).await?;
        Ok(SendOutcome { end, limit })
    }

    /// Stored prompts of an application, replayed as `history` events.
    pub async fn app_history(&self, app_id: &str) -> Result<Vec<AgentEvent>, ClientError> {
        let resp = self
            .authorize(self.http.get(self.url(&format!("/apps/{app_id}/history"))))
            .send()
            .await?;
        let prompts: Vec<AppPrompt> = check_status(resp).await?.json().await?;
        tracing::debug!(app_id, count = prompts.len(), "fetched history");
        Ok(history_events(app_id, prompts))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %body, "backend rejected request");
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Adapt a streaming response body into a line reader.
pub fn body_reader(resp: reqwest::Response) -> impl AsyncBufRead + Unpin + Send {
    StreamReader::new(Box::pin(resp.bytes_stream().map_err(std::io::Error::other)))
}

fn history_events(app_id: &str, prompts: Vec<AppPrompt>) -> Vec<AgentEvent> {
    prompts
        .into_iter()
        .map(|mut prompt| {
            if prompt.app_id.is_none() {
                prompt.app_id = Some(app_id.to_string());
            }
            prompt.into_event()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentStatus, MessageKind, PromptKind};
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-dailylimit-limit", HeaderValue::from_static("10"));
        headers.insert("x-dailylimit-remaining", HeaderValue::from_static("3"));
        headers.insert("x-dailylimit-usage", HeaderValue::from_static("7"));
        headers.insert(
            "x-dailylimit-reset",
            HeaderValue::from_static("2025-06-01T00:00:00.000Z"),
        );

        let limit = MessageLimit::from_headers(&headers).unwrap();
        assert_eq!(limit.limit, 10);
        assert_eq!(limit.remaining, 3);
        assert_eq!(limit.usage, Some(7));
        assert_eq!(limit.reset.unwrap().to_rfc3339(), "2025-06-01T00:00:00+00:00");
        assert!(!limit.is_exhausted());
    }

    #[test]
    fn missing_limit_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(MessageLimit::from_headers(&headers), None);
        headers.insert("x-dailylimit-limit", HeaderValue::from_static("10"));
        headers.insert("x-dailylimit-remaining", HeaderValue::from_static("lots"));
        assert_eq!(MessageLimit::from_headers(&headers), None);
    }

    #[test]
    fn message_body_wire_format() {
        let thread = Thread {
            application_id: "42".into(),
            trace_id: TraceId::new("42", "7"),
        };
        let request = SendMessage::new("add a dark mode").on_thread(&thread);
        let body = MessageBody {
            message: &request.message,
            client_source: CLIENT_SOURCE,
            application_id: request.application_id.as_deref(),
            trace_id: request.trace_id.as_ref(),
            environment: Some(Environment::Staging),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["message"], "add a dark mode");
        assert_eq!(json["clientSource"], "cli");
        assert_eq!(json["applicationId"], "42");
        assert_eq!(json["traceId"], "app-42.req-7");
        assert_eq!(json["environment"], "staging");
    }

    #[test]
    fn new_message_omits_thread() {
        let request = SendMessage::new("build a todo app");
        let body = MessageBody {
            message: &request.message,
            client_source: CLIENT_SOURCE,
            application_id: None,
            trace_id: None,
            environment: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(!obj.contains_key("traceId"));
    }

    #[test]
    fn history_fills_missing_app_id() {
        let prompts = vec![AppPrompt {
            id: "p1".into(),
            app_id: None,
            prompt: "hello".into(),
            kind: PromptKind::User,
            created_at: None,
        }];
        let events = history_events("9", prompts);
        assert_eq!(events[0].application_id(), Some("9"));
        assert_eq!(events[0].status, AgentStatus::History);
        assert_eq!(events[0].kind(), MessageKind::UserMessage);
    }

    #[test]
    fn url_joining() {
        let client = AgentClient::new(ClientConfig {
            base_url: "http://localhost:4444/".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        assert_eq!(client.url("/message"), "http://localhost:4444/message");
    }

    #[test]
    fn status_errors_are_transport_failures() {
        let err = ClientError::Status {
            status: 429,
            body: "daily limit reached".into(),
        };
        assert!(err.is_transport());
        let err = ClientError::Stream(StreamError::Protocol {
            message: "boom".into(),
            trace_id: None,
        });
        assert!(!err.is_transport());
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("staging".parse::<Environment>(), Ok(Environment::Staging));
        assert!("dev".parse::<Environment>().is_err());
    }
}
