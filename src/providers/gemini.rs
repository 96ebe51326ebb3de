//! Google Gemini backend over the Generative Language REST API.
//!
//! The system prompt travels in `systemInstruction`, tools as
//! `functionDeclarations`, and tool turns as `functionCall` /
//! `functionResponse` parts.

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::{
    ImageRef, ModelClient, ModelDelta, ModelFuture, ModelReply, ModelRequest, ModelStreamFuture,
    ProviderError, Turn,
};
use crate::providers::collapse_deltas;
use crate::providers::http_errors::{model_api_request_error, model_api_status_error};
use crate::providers::stream::{response_lines, sse_data};
use crate::tools::ToolSpec;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    http: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout_secs: u64,
    vision: bool,
}

impl GeminiClient {
    pub fn new(http: Client, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key,
            model: model.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            timeout_secs: 60,
            vision: true,
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

    fn api_url(&self, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if stream {
            format!("{base}/models/{}:streamGenerateContent?alt=sse", self.model)
        } else {
            format!("{base}/models/{}:generateContent", self.model)
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Configuration(
                "Gemini credentials are missing. Set GOOGLE_API_KEY or GEMINI_API_KEY.".to_string(),
            )
        })
    }

    async fn send(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key()?;
        let api_url = self.api_url(stream);
        let body = build_request_body(request);
        debug!(
            api_url = %api_url,
            model = %self.model,
            turn_count = request.turns.len(),
            tool_count = request.tools.len(),
            stream,
            "sending gemini request"
        );

        let mut builder = self
            .http
            .post(&api_url)
            .header("x-goog-api-key", api_key)
            .json(&body);
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.timeout_secs));
        }

        let response = builder.send().await.map_err(|err| {
            warn!(api_url = %api_url, model = %self.model, error = %err, "gemini request failed");
            model_api_request_error(err, &api_url, self.timeout_secs)
        })?;

        let status = response.status();
        if !status.is_success() {
            let response_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            warn!(
                api_url = %api_url,
                model = %self.model,
                status = %status,
                response_body_len = response_body.len(),
                "gemini returned non-success status"
            );
            return Err(model_api_status_error(status, &response_body));
        }

        Ok(response)
    }
}

impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn chat<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let response = self.send(request, false).await?;
            let parsed: GeminiResponse = response
                .json()
                .await
                .map_err(|err| ProviderError::Parse(err.to_string()))?;
            if parsed.candidates.is_empty() {
                return Err(ProviderError::Parse(match parsed.prompt_feedback {
                    Some(feedback) => format!(
                        "no candidates in response (block reason: {})",
                        feedback.block_reason.unwrap_or_else(|| "unknown".to_string())
                    ),
                    None => "no candidates in response".to_string(),
                }));
            }
            let reply = collapse_deltas(response_deltas(parsed));
            debug!(
                model = %self.model,
                tool_call = matches!(reply, ModelReply::ToolCall { .. }),
                "received gemini response"
            );
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
                    let Some(data) = sse_data(&line) else {
                        continue;
                    };
                    match serde_json::from_str::<GeminiResponse>(data) {
                        Ok(chunk) => {
                            for delta in response_deltas(chunk) {
                                yield Ok(delta);
                            }
                        }
                        Err(err) => {
                            yield Err(ProviderError::Parse(err.to_string()));
                            break;
                        }
                    }
                }
            };
            Ok(deltas.boxed())
        })
    }
}

/// Builds the `generateContent` body for `request`.
///
/// Consecutive turns with the same role share one content entry, so text
/// spoken ahead of a function call travels with it.
pub(crate) fn build_request_body(request: &ModelRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    for content in request.turns.iter().map(turn_to_content) {
        if let Some(last) = contents.last_mut()
            && last["role"] == content["role"]
            && let (Some(parts), Some(more)) = (last["parts"].as_array_mut(), content["parts"].as_array())
        {
            parts.extend(more.iter().cloned());
            continue;
        }
        contents.push(content);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": request.temperature,
        }
    });

    if !request.system_prompt.trim().is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": request.system_prompt }]
        });
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request.tools.iter().map(to_function_declaration).collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn turn_to_content(turn: &Turn) -> Value {
    match turn {
        Turn::User { text, image } => {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(json!({ "text": text }));
            }
            if let Some(image) = image {
                parts.push(image_part(image));
            }
            json!({ "role": "user", "parts": parts })
        }
        Turn::Assistant { text } => json!({ "role": "model", "parts": [{ "text": text }] }),
        Turn::ToolCall {
            name,
            arguments,
            signature,
        } => {
            let mut part = json!({ "functionCall": { "name": name, "args": arguments } });
            if let Some(signature) = signature {
                part["thoughtSignature"] = json!(signature);
            }
            json!({ "role": "model", "parts": [part] })
        }
        Turn::ToolResult { name, result } => json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": name,
                    "response": { "result": result }
                }
            }]
        }),
    }
}

fn image_part(image: &ImageRef) -> Value {
    match image {
        ImageRef::Inline { mime_type, data } => json!({
            "inlineData": { "mimeType": mime_type, "data": data }
        }),
        ImageRef::Url { url } => json!({
            "fileData": { "mimeType": mime_type_for_url(url), "fileUri": url }
        }),
    }
}

fn mime_type_for_url(url: &str) -> &'static str {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match path.rsplit('.').next() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
}

fn to_function_declaration(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn response_deltas(response: GeminiResponse) -> Vec<ModelDelta> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Vec::new();
    };

    candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| {
            if let Some(call) = part.function_call {
                return Some(ModelDelta::ToolCall {
                    name: call.name,
                    arguments: call.args.unwrap_or_else(|| json!({})),
                    signature: part.thought_signature,
                });
            }
            part.text
                .filter(|text| !text.is_empty())
                .map(ModelDelta::Text)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    function_call: Option<GeminiFunctionCall>,
    /// Must be sent back with the call on the next request.
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use reqwest::Client;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{GeminiClient, build_request_body, mime_type_for_url};
    use crate::model::{
        ImageRef, ModelClient, ModelDelta, ModelReply, ModelRequest, ProviderError, Turn,
    };
    use crate::tools::ToolSpec;

    fn request(turns: Vec<Turn>) -> ModelRequest {
        ModelRequest {
            system_prompt: "Be direct.".to_string(),
            turns,
            tools: vec![ToolSpec {
                name: "search_web".to_string(),
                description: "search".to_string(),
                parameters: json!({"type": "object"}),
            }],
            temperature: 0.0,
        }
    }

    fn client_for(server: &MockServer) -> GeminiClient {
        GeminiClient::new(Client::new(), Some("g-key".to_string()), "gemini-test")
            .with_base_url(server.uri())
    }

    #[test]
    fn request_body_maps_turns_to_gemini_contents() {
        let body = build_request_body(&request(vec![
            Turn::user_with_image(
                "what is this?",
                ImageRef::Inline {
                    mime_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            ),
            Turn::tool_call("search_web", json!({"query": "logo"})),
            Turn::tool_result("search_web", "a logo"),
            Turn::assistant("It is a logo."),
        ]));

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be direct.");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "search_web"
        );

        let contents = body["contents"].as_array().expect("contents array");
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "what is this?");
        assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["query"], "logo");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["result"],
            "a logo"
        );
        assert_eq!(contents[3]["parts"][0]["text"], "It is a logo.");
    }

    #[test]
    fn request_body_omits_empty_system_prompt_and_tools() {
        let mut req = request(vec![Turn::user("hi")]);
        req.system_prompt = "  ".to_string();
        req.tools.clear();
        let body = build_request_body(&req);
        assert!(body.get("systemInstruction").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn url_images_become_file_data_with_guessed_mime_type() {
        let body = build_request_body(&request(vec![Turn::user_with_image(
            "",
            ImageRef::Url {
                url: "https://cdn.example.com/a.PNG?size=2".to_string(),
            },
        )]));
        let parts = body["contents"][0]["parts"].as_array().expect("parts");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["fileData"]["mimeType"], "image/png");
        assert_eq!(mime_type_for_url("https://x.test/photo"), "image/jpeg");
    }

    #[tokio::test]
    async fn chat_returns_text_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .and(body_partial_json(json!({"contents": [{"role": "user"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "there"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client_for(&server)
            .chat(&request(vec![Turn::user("hi")]))
            .await
            .expect("chat should succeed");
        assert_eq!(reply, ModelReply::Text("Hello there".to_string()));
    }

    #[tokio::test]
    async fn chat_returns_function_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [
                    {"functionCall": {"name": "search_web", "args": {"query": "weather"}}}
                ]}}]
            })))
            .mount(&server)
            .await;

        let reply = client_for(&server)
            .chat(&request(vec![Turn::user("weather?")]))
            .await
            .expect("chat should succeed");
        assert_eq!(
            reply,
            ModelReply::ToolCall {
                name: "search_web".to_string(),
                arguments: json!({"query": "weather"}),
                signature: None,
            }
        );
    }

    #[test]
    fn request_body_replays_signed_calls_with_their_preamble() {
        let body = build_request_body(&request(vec![
            Turn::user("weather?"),
            Turn::assistant("Let me check."),
            Turn::ToolCall {
                name: "search_web".to_string(),
                arguments: json!({"query": "weather"}),
                signature: Some("sig-1".to_string()),
            },
            Turn::tool_result("search_web", "sunny"),
        ]));

        let contents = body["contents"].as_array().expect("contents array");
        assert_eq!(contents.len(), 3);
        let parts = contents[1]["parts"].as_array().expect("model parts");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(parts[0]["text"], "Let me check.");
        assert_eq!(parts[1]["functionCall"]["name"], "search_web");
        assert_eq!(parts[1]["thoughtSignature"], "sig-1");
        assert!(
            build_request_body(&request(vec![Turn::tool_call("search_web", json!({}))]))["contents"][0]
                ["parts"][0]
                .get("thoughtSignature")
                .is_none()
        );
    }

    #[tokio::test]
    async fn thought_signature_survives_a_tool_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(body_partial_json(json!({"contents": [
                {"role": "user"},
                {"role": "model", "parts": [{"thoughtSignature": "sig-1"}]}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "Sunny."}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{
                    "functionCall": {"name": "search_web", "args": {"query": "weather"}},
                    "thoughtSignature": "sig-1"
                }]}}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let reply = client
            .chat(&request(vec![Turn::user("weather?")]))
            .await
            .expect("first call should succeed");
        let (name, arguments, signature) = match reply {
            ModelReply::ToolCall {
                name,
                arguments,
                signature,
            } => (name, arguments, signature),
            other => panic!("expected a tool call, got {other:?}"),
        };
        assert_eq!(signature.as_deref(), Some("sig-1"));

        let answer = client
            .chat(&request(vec![
                Turn::user("weather?"),
                Turn::ToolCall {
                    name: name.clone(),
                    arguments,
                    signature,
                },
                Turn::tool_result(name, "sunny"),
            ]))
            .await
            .expect("signed replay should be accepted");
        assert_eq!(answer, ModelReply::Text("Sunny.".to_string()));
    }

    #[tokio::test]
    async fn chat_maps_rate_limits_and_auth_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let req = request(vec![Turn::user("hi")]);
        assert_eq!(client.chat(&req).await, Err(ProviderError::RateLimited));
        assert_eq!(
            client.chat(&req).await,
            Err(ProviderError::Auth("API key not valid".to_string()))
        );
    }

    #[tokio::test]
    async fn chat_without_credentials_is_a_configuration_error() {
        let client = GeminiClient::new(Client::new(), None, "gemini-test")
            .with_base_url("http://127.0.0.1:9");
        let err = client
            .chat(&request(vec![Turn::user("hi")]))
            .await
            .expect_err("missing key should fail");
        assert!(matches!(err, ProviderError::Configuration(_)), "{err:?}");
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
    }

    #[tokio::test]
    async fn chat_stream_yields_sse_fragments_in_order() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Our number \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"is 555-0100.\"}]}}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let req = request(vec![Turn::user("phone?")]);
        let deltas: Vec<_> = client
            .chat_stream(&req)
            .await
            .expect("stream should start")
            .collect()
            .await;

        assert_eq!(
            deltas,
            vec![
                Ok(ModelDelta::Text("Our number ".to_string())),
                Ok(ModelDelta::Text("is 555-0100.".to_string())),
            ]
        );
    }
}
