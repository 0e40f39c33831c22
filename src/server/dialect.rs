//! Inbound request dialects and their validation.
//!
//! Three dialects reach the adapter:
//! - Chat: OpenAI-style `/v1/chat/completions` with a `messages` array
//! - Completion: OpenAI-style `/v1/completions` with a `prompt` string
//! - Invocation: the hosting platform's `/invocations`, which carries either of
//!   the above and is classified by its fields
//!
//! Validation only checks the fields needed to route the request. The body
//! forwarded to the engine is always the exact bytes the client sent.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::server::error::AdapterError;

/// Which inbound surface a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Chat,
    Completion,
    Invocation,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Chat => "chat",
            Dialect::Completion => "completion",
            Dialect::Invocation => "invocation",
        }
    }
}

/// One chat message, as much of it as routing needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content: plain text or a list of content parts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

/// A validated inference request, classified by engine endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceRequest {
    Chat {
        messages: Vec<ChatMessage>,
        stream: bool,
    },
    Completion {
        prompt: String,
        stream: bool,
    },
}

impl InferenceRequest {
    /// Validate `body` for `dialect`.
    pub fn parse(dialect: Dialect, body: &[u8]) -> Result<Self, AdapterError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| AdapterError::invalid(format!("Request body is not valid JSON: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(AdapterError::invalid("Request body must be a JSON object"));
        };

        match dialect {
            Dialect::Chat => parse_chat(&obj),
            Dialect::Completion => parse_completion(&obj),
            Dialect::Invocation => {
                match (obj.contains_key("messages"), obj.contains_key("prompt")) {
                    (true, false) => parse_chat(&obj),
                    (false, true) => parse_completion(&obj),
                    (true, true) => Err(AdapterError::invalid(
                        "Ambiguous request: provide either `messages` or `prompt`, not both",
                    )),
                    (false, false) => Err(AdapterError::invalid(
                        "Request must contain `messages` (chat) or `prompt` (completion)",
                    )),
                }
            }
        }
    }

    /// Engine endpoint serving this request.
    pub fn engine_path(&self) -> &'static str {
        match self {
            InferenceRequest::Chat { .. } => "/v1/chat/completions",
            InferenceRequest::Completion { .. } => "/v1/completions",
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            InferenceRequest::Chat { stream, .. } | InferenceRequest::Completion { stream, .. } => {
                *stream
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InferenceRequest::Chat { .. } => "chat",
            InferenceRequest::Completion { .. } => "completion",
        }
    }
}

fn stream_flag(obj: &Map<String, Value>) -> Result<bool, AdapterError> {
    match obj.get("stream") {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(AdapterError::invalid("`stream` must be a boolean")),
    }
}

fn parse_chat(obj: &Map<String, Value>) -> Result<InferenceRequest, AdapterError> {
    let messages = match obj.get("messages") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => return Err(AdapterError::invalid("`messages` must not be empty")),
        Some(_) => return Err(AdapterError::invalid("`messages` must be an array")),
        None => return Err(AdapterError::invalid("Missing required field `messages`")),
    };

    let messages = messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            ChatMessage::deserialize(m).map_err(|_| {
                AdapterError::invalid(format!(
                    "`messages[{i}]` must have a string `role` and a string or array `content`"
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InferenceRequest::Chat {
        messages,
        stream: stream_flag(obj)?,
    })
}

fn parse_completion(obj: &Map<String, Value>) -> Result<InferenceRequest, AdapterError> {
    let prompt = match obj.get("prompt") {
        Some(Value::String(p)) if !p.is_empty() => p.clone(),
        Some(Value::String(_)) => return Err(AdapterError::invalid("`prompt` must not be empty")),
        Some(_) => return Err(AdapterError::invalid("`prompt` must be a string")),
        None => return Err(AdapterError::invalid("Missing required field `prompt`")),
    };

    Ok(InferenceRequest::Completion {
        prompt,
        stream: stream_flag(obj)?,
    })
}

/// Everything known about one request while it is translated and forwarded.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    pub dialect: Dialect,
    pub request: InferenceRequest,
    pub request_id: String,
    /// Original body, forwarded verbatim.
    pub body: Bytes,
}

impl TranslationContext {
    pub fn new(dialect: Dialect, body: Bytes, request_id: String) -> Result<Self, AdapterError> {
        let request = InferenceRequest::parse(dialect, &body)?;
        Ok(Self {
            dialect,
            request,
            request_id,
            body,
        })
    }
}
