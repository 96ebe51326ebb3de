use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::{
    ImageRef, ModelClient, ModelDelta, ModelFuture, ModelReply, ModelRequest, ModelStreamFuture,
    ProviderError, Turn,
};
use crate::providers::collapse_deltas;
use crate::providers::http_errors::{model_api_request_error, model_api_status_error};
use crate::providers::stream::response_lines;
use crate::tools::ToolSpec;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    http: Client,
    model: String,
    base_url: String,
    timeout_secs: u64,
    vision: bool,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    stream: bool,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<ChatMessageResponse>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaClient {
    pub fn new(http: Client, model: impl Into<String>) -> Self {
        Self {
            http,
            model: model.into(),
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            timeout_secs: 60,
            vision: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    async fn send(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_url = chat_url(&self.base_url);
        let body = OllamaChatRequest {
            model: self.model.clone(),
            stream,
            messages: to_ollama_messages(request),
            tools: request.tools.iter().map(to_ollama_tool).collect(),
            options: ChatOptions {
                temperature: request.temperature,
            },
        };
        debug!(
            api_url = %api_url,
            model = %self.model,
            message_count = body.messages.len(),
            stream,
            "sending ollama chat request"
        );

        let mut builder = self.http.post(&api_url).json(&body);
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.timeout_secs));
        }

        let response = builder.send().await.map_err(|err| {
            warn!(
                api_url = %api_url,
                model = %self.model,
                error = %err,
                "ollama request failed"
            );
            model_api_request_error(err, &api_url, self.timeout_secs)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let response_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            warn!(
                api_url = %api_url,
                model = %self.model,
                status = %status,
                response_body_len = response_body.len(),
                "ollama returned non-success status"
            );
            return Err(model_api_status_error(status, &response_body));
        }

        Ok(response)
    }
}

fn chat_url(base_url: &str) -> String {
    format!("{}/api/chat", base_url.trim_end_matches('/'))
}

fn to_ollama_messages(request: &ModelRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.turns.len() + 1);
    if !request.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::text("system", request.system_prompt.clone()));
    }

    for turn in &request.turns {
        let message = match turn {
            Turn::User { text, image } => {
                let mut message = ChatMessage::text("user", text.clone());
                match image {
                    Some(ImageRef::Inline { data, .. }) => message.images.push(data.clone()),
                    // Ollama cannot fetch remote images.
                    Some(ImageRef::Url { url }) => {
                        message.content = format!("{text}\n[attached image: {url}]").trim().to_string();
                    }
                    None => {}
                }
                message
            }
            Turn::Assistant { text } => ChatMessage::text("assistant", text.clone()),
            Turn::ToolCall { name, arguments, .. } => {
                let mut message = ChatMessage::text("assistant", "");
                message.tool_calls.push(json!({
                    "function": { "name": name, "arguments": arguments }
                }));
                message
            }
            Turn::ToolResult { name, result } => {
                let mut message = ChatMessage::text("tool", result.clone());
                message.tool_name = Some(name.clone());
                message
            }
        };
        messages.push(message);
    }

    messages
}

fn to_ollama_tool(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn message_deltas(message: ChatMessageResponse) -> Vec<ModelDelta> {
    let mut deltas = Vec::new();
    if !message.content.is_empty() {
        deltas.push(ModelDelta::Text(message.content));
    }
    deltas.extend(message.tool_calls.into_iter().map(|call| ModelDelta::ToolCall {
        name: call.function.name,
        arguments: match call.function.arguments {
            Value::Null => json!({}),
            other => other,
        },
        signature: None,
    }));
    deltas
}

fn into_reply(response: OllamaChatResponse) -> Result<ModelReply, ProviderError> {
    if let Some(error) = response.error {
        return Err(ProviderError::Api { status: 200, body: error });
    }
    let message = response
        .message
        .ok_or_else(|| ProviderError::Parse("response has no message".to_string()))?;

    Ok(collapse_deltas(message_deltas(message)))
}

impl ModelClient for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn chat<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let response = self.send(request, false).await?;
            let parsed: OllamaChatResponse = response
                .json()
                .await
                .map_err(|err| ProviderError::Parse(err.to_string()))?;
            let reply = into_reply(parsed)?;
            debug!(model = %self.model, "received ollama chat response");
            Ok(reply)
        })
    }

    fn chat_stream<'a>(&'a self, request: &'a ModelRequest) -> ModelStreamFuture<'a> {
        Box::pin(async move {
            let response = self.send(request, true).await?;
            let mut lines = response_lines(response);

            let deltas = async_stream::stream! {
                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            yield Err(err);
                            break;
                        }
                    };
                    let chunk = match serde_json::from_str::<OllamaChatResponse>(&line) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            yield Err(ProviderError::Parse(err.to_string()));
                            break;
                        }
                    };
                    if let Some(error) = chunk.error {
                        yield Err(ProviderError::Api { status: 200, body: error });
                        break;
                    }
                    if let Some(message) = chunk.message {
                        for delta in message_deltas(message) {
                            yield Ok(delta);
                        }
                    }
                }
            };
            Ok(deltas.boxed())
        })
    }
}
