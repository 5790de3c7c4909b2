//! Agent events: the typed form of every payload streamed by the agent.
//!
//! Decoding is an explicit step ([`AgentEvent::from_value`]) that fails
//! closed: a missing `traceId`, an unknown `status` or an unknown message
//! `kind` is a [`SchemaError`], never a silently defaulted value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::trace::TraceId;

/// State of the run that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Still producing content.
    Running,
    /// Quiescent, waiting for a human decision.
    Idle,
    /// Replay of a previously recorded message.
    History,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::History => "history",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AgentStatus::Running),
            "idle" => Ok(AgentStatus::Idle),
            "history" => Ok(AgentStatus::History),
            other => Err(SchemaError::UnknownStatus(other.to_string())),
        }
    }
}

/// What a message is for.
///
/// `PlatformMessage` and `UserMessage` are never sent by the agent; the
/// client builds them to represent system notices and echoed user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    KeepAlive,
    StageResult,
    RuntimeError,
    /// The only kind that needs a human answer before the run continues.
    RefinementRequest,
    ReviewResult,
    PlatformMessage,
    UserMessage,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::KeepAlive => "KeepAlive",
            MessageKind::StageResult => "StageResult",
            MessageKind::RuntimeError => "RuntimeError",
            MessageKind::RefinementRequest => "RefinementRequest",
            MessageKind::ReviewResult => "ReviewResult",
            MessageKind::PlatformMessage => "PlatformMessage",
            MessageKind::UserMessage => "UserMessage",
        }
    }

    /// Client-only kinds that the server never emits.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, MessageKind::PlatformMessage | MessageKind::UserMessage)
    }
}

impl FromStr for MessageKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KeepAlive" => Ok(MessageKind::KeepAlive),
            "StageResult" => Ok(MessageKind::StageResult),
            "RuntimeError" => Ok(MessageKind::RuntimeError),
            "RefinementRequest" => Ok(MessageKind::RefinementRequest),
            "ReviewResult" => Ok(MessageKind::ReviewResult),
            "PlatformMessage" => Ok(MessageKind::PlatformMessage),
            "UserMessage" => Ok(MessageKind::UserMessage),
            other => Err(SchemaError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-type of a platform notice, carried in `metadata.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformMessageType {
    DeploymentComplete,
    DeploymentFailed,
    RepoCreated,
    CommitCreated,
}

impl PlatformMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformMessageType::DeploymentComplete => "deployment_complete",
            PlatformMessageType::DeploymentFailed => "deployment_failed",
            PlatformMessageType::RepoCreated => "repo_created",
            PlatformMessageType::CommitCreated => "commit_created",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "deployment_complete" => Some(PlatformMessageType::DeploymentComplete),
            "deployment_failed" => Some(PlatformMessageType::DeploymentFailed),
            "repo_created" => Some(PlatformMessageType::RepoCreated),
            "commit_created" => Some(PlatformMessageType::CommitCreated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    ToolUse,
    ToolUseResult,
}

/// A typed piece of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub text: String,
}

/// Message content: plain text, typed blocks, or any other JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Structured(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Readable text of the content.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Structured(v) => v.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Blocks(blocks) => blocks.iter().all(|b| b.text.is_empty()),
            MessageContent::Structured(v) => v.is_null(),
        }
    }
}

/// One `{role, content}` entry of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

impl ConversationMessage {
    pub fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.to_string()),
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }
}

/// Message-level metadata. Only `type` is interpreted; the rest is kept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    pub fn of_type(kind: PlatformMessageType) -> Self {
        Self {
            tag: Some(kind.as_str().to_string()),
            extra: Map::new(),
        }
    }

    /// The tag as a known platform sub-type, if it is one.
    pub fn platform_type(&self) -> Option<PlatformMessageType> {
        self.tag.as_deref().and_then(PlatformMessageType::from_wire)
    }
}

/// The body of an agent event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub kind: MessageKind,
    pub messages: Vec<ConversationMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

impl AgentMessage {
    fn new(kind: MessageKind, messages: Vec<ConversationMessage>) -> Self {
        Self {
            kind,
            messages,
            metadata: None,
            agent_state: None,
            unified_diff: None,
            app_name: None,
            commit_message: None,
        }
    }

    /// The `metadata.type` tag, if any.
    pub fn metadata_tag(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.tag.as_deref())
    }

    pub fn platform_type(&self) -> Option<PlatformMessageType> {
        self.metadata.as_ref().and_then(MessageMetadata::platform_type)
    }

    fn from_value(value: Value) -> Result<Self, SchemaError> {
        let Value::Object(mut obj) = value else {
            return Err(SchemaError::WrongType("message"));
        };

        let kind = match obj.remove("kind") {
            Some(Value::String(s)) => s.parse::<MessageKind>()?,
            Some(_) => return Err(SchemaError::WrongType("message.kind")),
            None => return Err(SchemaError::MissingField("message.kind")),
        };

        let messages = match (obj.remove("messages"), obj.remove("content")) {
            (Some(Value::Array(items)), _) => {
                serde_json::from_value(Value::Array(items)).map_err(|source| {
                    SchemaError::Invalid {
                        field: "message.messages",
                        source,
                    }
                })?
            }
            (Some(Value::Null) | None, Some(content)) => messages_from_content(content)?,
            (Some(Value::Null) | None, None) => Vec::new(),
            (Some(_), _) => return Err(SchemaError::WrongType("message.messages")),
        };

        let metadata = match obj.remove("metadata") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value(v).map_err(|source| SchemaError::Invalid {
                field: "message.metadata",
                source,
            })?),
        };

        let mut message = AgentMessage::new(kind, messages);
        message.metadata = metadata;
        message.agent_state = obj.remove("agentState").filter(|v| !v.is_null());
        message.unified_diff = take_string(&mut obj, &["unifiedDiff", "unified_diff"]);
        message.app_name = take_string(&mut obj, &["appName", "app_name"]);
        message.commit_message = take_string(&mut obj, &["commitMessage", "commit_message"]);
        Ok(message)
    }
}

/// The canonical unit stored in a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct AgentEvent {
    pub status: AgentStatus,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub message: AgentMessage,
}

impl AgentEvent {
    /// Decode a wire payload into an event, failing closed on any schema
    /// violation.
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let Value::Object(mut obj) = value else {
            return Err(SchemaError::NotAnObject);
        };

        let status = match obj.remove("status") {
            Some(Value::String(s)) => s.parse::<AgentStatus>()?,
            Some(_) => return Err(SchemaError::WrongType("status")),
            None => return Err(SchemaError::MissingField("status")),
        };

        let trace_id = match obj.remove("traceId") {
            Some(Value::String(s)) => TraceId::from(s),
            Some(Value::Null) | None => return Err(SchemaError::MissingField("traceId")),
            Some(_) => return Err(SchemaError::WrongType("traceId")),
        };

        let created_at = match obj.remove("createdAt") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value(v).map_err(|source| SchemaError::Invalid {
                field: "createdAt",
                source,
            })?),
        };

        let message = match obj.remove("message") {
            Some(v) => AgentMessage::from_value(v)?,
            None => return Err(SchemaError::MissingField("message")),
        };

        Ok(Self {
            status,
            trace_id,
            created_at,
            message,
        })
    }

    /// A client-side platform notice.
    pub fn platform(
        status: AgentStatus,
        trace_id: TraceId,
        text: &str,
        kind: Option<PlatformMessageType>,
    ) -> Self {
        let mut message = AgentMessage::new(
            MessageKind::PlatformMessage,
            vec![ConversationMessage::assistant(text)],
        );
        message.metadata = kind.map(MessageMetadata::of_type);
        Self {
            status,
            trace_id,
            created_at: Some(Utc::now()),
            message,
        }
    }

    /// Echo of what the user sent, filed before the agent answers.
    pub fn user(trace_id: TraceId, text: &str) -> Self {
        Self {
            status: AgentStatus::Idle,
            trace_id,
            created_at: Some(Utc::now()),
            message: AgentMessage::new(MessageKind::UserMessage, vec![ConversationMessage::user(text)]),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind
    }

    pub fn is_platform(&self) -> bool {
        self.message.kind == MessageKind::PlatformMessage
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    pub fn application_id(&self) -> Option<&str> {
        self.trace_id.application_id()
    }

    /// All message texts, one per line, skipping empty ones.
    pub fn text(&self) -> String {
        self.message
            .messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| m.content.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl TryFrom<Value> for AgentEvent {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        AgentEvent::from_value(value)
    }
}

/// Who wrote a stored prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    User,
    Assistant,
}

/// A prompt from an application's stored history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPrompt {
    pub id: String,
    #[serde(default)]
    pub app_id: Option<String>,
    pub prompt: String,
    pub kind: PromptKind,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl AppPrompt {
    /// Replay a stored prompt as a `history` event.
    pub fn into_event(self) -> AgentEvent {
        let (role, kind) = match self.kind {
            PromptKind::User => (Role::User, MessageKind::UserMessage),
            PromptKind::Assistant => (Role::Assistant, MessageKind::PlatformMessage),
        };
        let mut message = AgentMessage::new(
            kind,
            vec![ConversationMessage {
                role,
                content: MessageContent::Text(self.prompt),
            }],
        );
        message.agent_state = Some(Value::Object(Map::new()));
        AgentEvent {
            status: AgentStatus::History,
            trace_id: TraceId::new(self.app_id.as_deref().unwrap_or_default(), &self.id),
            created_at: self.created_at,
            message,
        }
    }
}

/// Why a payload could not be decoded into an [`AgentEvent`].
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("unknown status `{0}`")]
    UnknownStatus(String),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("invalid `{field}`: {source}")]
    Invalid {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The backend may send its conversation as `content`: a JSON array, or a
/// string holding one. Unparseable strings become a single assistant text.
fn messages_from_content(content: Value) -> Result<Vec<ConversationMessage>, SchemaError> {
    let content = match content {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Array(_)) => v,
            _ => return Ok(vec![ConversationMessage::assistant(&s)]),
        },
        Value::Null => return Ok(Vec::new()),
        other => other,
    };

    if let Ok(messages) = serde_json::from_value::<Vec<ConversationMessage>>(content.clone()) {
        return Ok(messages);
    }
    serde_json::from_value::<Vec<ContentBlock>>(content)
        .map(|blocks| {
            vec![ConversationMessage {
                role: Role::Assistant,
                content: MessageContent::Blocks(blocks),
            }]
        })
        .map_err(|source| SchemaError::Invalid {
            field: "message.content",
            source,
        })
}

fn take_string(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.remove(*k) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}
