use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

use crate::tools::ToolSpec;

/// An image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    /// Inline `data:<mime>;base64,<payload>` image.
    Inline { mime_type: String, data: String },
    /// Externally hosted image.
    Url { url: String },
}

impl ImageRef {
    /// Accepts base64 data URIs and http(s) URLs.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("data:") {
            let (header, data) = rest.split_once(',')?;
            let mime_type = header.strip_suffix(";base64")?;
            if !mime_type.starts_with("image/") || data.is_empty() {
                return None;
            }
            return Some(Self::Inline {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            });
        }

        let lower = raw.to_ascii_lowercase();
        let host_and_path = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))?;
        if host_and_path.is_empty() {
            return None;
        }
        Some(Self::Url {
            url: raw.to_string(),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Inline { mime_type, .. } => format!("inline {mime_type} image"),
            Self::Url { url } => url.clone(),
        }
    }
}

/// One unit of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
        image: Option<ImageRef>,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        name: String,
        arguments: Value,
        /// Opaque provider token that must accompany the call when it is
        /// replayed, such as Gemini's `thoughtSignature`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolResult {
        name: String,
        result: String,
    },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            image: None,
        }
    }

    pub fn user_with_image(text: impl Into<String>, image: ImageRef) -> Self {
        Self::User {
            text: text.into(),
            image: Some(image),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant { text: text.into() }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            arguments,
            signature: None,
        }
    }

    pub fn tool_result(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self::ToolResult {
            name: name.into(),
            result: result.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
        }
    }
}

/// Everything a provider needs for one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    ToolCall {
        name: String,
        arguments: Value,
        signature: Option<String>,
    },
}

/// Incremental output of a streaming model call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    ToolCall {
        name: String,
        arguments: Value,
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Missing or unusable credential; fatal for the call, not the process.
    #[error("{0}")]
    Configuration(String),
    #[error("model provider rejected the credentials: {0}")]
    Auth(String),
    #[error("model provider rate limited the request")]
    RateLimited,
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Network(String),
    #[error("model request failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse model response: {0}")]
    Parse(String),
}

pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelReply, ProviderError>> + Send + 'a>>;
pub type ModelStream = BoxStream<'static, Result<ModelDelta, ProviderError>>;
pub type ModelStreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ModelStream, ProviderError>> + Send + 'a>>;

/// A chat-completion backend able to request tool calls.
pub trait ModelClient: Send + Sync {
    /// Model identifier, used in logs.
    fn name(&self) -> &str;

    fn supports_vision(&self) -> bool;

    fn chat<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a>;

    /// Streams the reply. Backends without native streaming emit the whole
    /// reply as a single delta.
    fn chat_stream<'a>(&'a self, request: &'a ModelRequest) -> ModelStreamFuture<'a> {
        Box::pin(async move {
            let delta = match self.chat(request).await? {
                ModelReply::Text(text) => ModelDelta::Text(text),
                ModelReply::ToolCall {
                    name,
                    arguments,
                    signature,
                } => ModelDelta::ToolCall {
                    name,
                    arguments,
                    signature,
                },
            };
            Ok(stream::once(async move { Ok(delta) }).boxed())
        })
    }
}
