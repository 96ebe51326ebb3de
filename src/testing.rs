//! Stub model clients and tools shared by unit tests.

use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::{
    ModelClient, ModelDelta, ModelFuture, ModelReply, ModelRequest, ModelStreamFuture, ProviderError, Turn,
};
use crate::providers::collapse_deltas;
use crate::tools::{Tool, ToolFuture, ToolSpec};

/// Replays canned replies in order and records every request it receives.
pub(crate) struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelReply, ProviderError>>>,
    repeat: Option<Result<ModelReply, ProviderError>>,
    requests: Mutex<Vec<ModelRequest>>,
    vision: bool,
}

impl ScriptedModel {
    pub(crate) fn new(replies: Vec<Result<ModelReply, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            vision: true,
        }
    }

    /// Answers every call with `reply`.
    pub(crate) fn repeating(reply: Result<ModelReply, ProviderError>) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub(crate) fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn chat<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            self.requests.lock().expect("requests lock").push(request.clone());
            let next = self.script.lock().expect("script lock").pop_front();
            match (next, &self.repeat) {
                (Some(reply), _) => reply,
                (None, Some(reply)) => reply.clone(),
                (None, None) => Err(ProviderError::Api {
                    status: 500,
                    body: "script exhausted".to_string(),
                }),
            }
        })
    }
}

/// Answers with every user message seen so far, newest last.
#[derive(Default)]
pub(crate) struct EchoModel;

impl ModelClient for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    fn supports_vision(&self) -> bool {
        false
    }

    fn chat<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let heard: Vec<&str> = request
                .turns
                .iter()
                .filter_map(|turn| match turn {
                    Turn::User { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            Ok(ModelReply::Text(format!("You said: {}", heard.join(" / "))))
        })
    }
}

type DeltaScript = Vec<Result<ModelDelta, ProviderError>>;

/// Streams one scripted sequence of deltas per call.
pub(crate) struct StreamingModel {
    scripts: Mutex<VecDeque<DeltaScript>>,
    /// Leave each stream open after its script instead of ending it.
    stall: bool,
}

impl StreamingModel {
    /// Streams a single text reply as the given fragments.
    pub(crate) fn new(fragments: &[&str]) -> Self {
        Self::scripted(vec![text_deltas(fragments)])
    }

    pub(crate) fn scripted(scripts: Vec<DeltaScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            stall: false,
        }
    }

    /// Streams `fragments` and then goes quiet without closing.
    pub(crate) fn stalling(fragments: &[&str]) -> Self {
        Self {
            stall: true,
            ..Self::new(fragments)
        }
    }

    fn next_script(&self) -> Result<DeltaScript, ProviderError> {
        self.scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| ProviderError::Api {
                status: 500,
                body: "script exhausted".to_string(),
            })
    }
}

pub(crate) fn text_deltas(fragments: &[&str]) -> DeltaScript {
    fragments
        .iter()
        .map(|fragment| Ok(ModelDelta::Text(fragment.to_string())))
        .collect()
}

impl ModelClient for StreamingModel {
    fn name(&self) -> &str {
        "streaming"
    }

    fn supports_vision(&self) -> bool {
        false
    }

    fn chat<'a>(&'a self, _request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let deltas = self.next_script()?.into_iter().collect::<Result<Vec<_>, _>>()?;
            Ok(collapse_deltas(deltas))
        })
    }

    fn chat_stream<'a>(&'a self, _request: &'a ModelRequest) -> ModelStreamFuture<'a> {
        Box::pin(async move {
            let deltas = stream::iter(self.next_script()?);
            if self.stall {
                Ok(deltas.chain(stream::pending()).boxed())
            } else {
                Ok(deltas.boxed())
            }
        })
    }
}

/// Tool that always returns the same output.
pub(crate) struct FixedTool {
    name: String,
    output: String,
}

impl FixedTool {
    pub(crate) fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
        }
    }
}

impl Tool for FixedTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: format!("Returns a fixed value for {}.", self.name),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn execute<'a>(&'a self, _arguments: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move { Ok(self.output.clone()) })
    }
}
