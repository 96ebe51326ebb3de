pub mod clock;
pub mod search;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;

pub use clock::ClockTool;
pub use search::SearchTool;

/// What the model sees about a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{0}")]
    Failed(String),
    #[error("tool '{tool}' timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },
}

/// Tool failures are data: both arms end up in the transcript as text.
pub type ToolOutcome = Result<String, ToolError>;
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutcome> + Send + 'a>>;

pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    fn execute<'a>(&'a self, arguments: &'a Value) -> ToolFuture<'a>;
}

pub fn render_outcome(outcome: &ToolOutcome) -> String {
    match outcome {
        Ok(output) => output.clone(),
        Err(err) => format!("ERROR: {err}"),
    }
}

/// Reads a required, non-blank string argument.
pub(crate) fn string_argument(tool: &str, arguments: &Value, key: &str) -> Result<String, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("'{key}' must be a non-empty string"),
        })
}

/// The tools bound to an agent, looked up by name.
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: Vec::new(),
            timeout,
        }
    }

    /// Web search plus the clock.
    pub fn builtin(client: &Client, cfg: &Config) -> Self {
        Self::new(Duration::from_secs(cfg.tool_timeout_secs))
            .with_tool(SearchTool::from_config(client.clone(), cfg))
            .with_tool(ClockTool)
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|tool| tool.spec()).collect()
    }

    pub async fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome {
        let Some(tool) = self.tools.iter().find(|tool| tool.spec().name == name) else {
            warn!(tool_name = %name, "model requested an unknown tool");
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        debug!(tool_name = %name, "executing tool");
        match tokio::time::timeout(self.timeout, tool.execute(arguments)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(tool_name = %name, timeout_secs = self.timeout.as_secs(), "tool timed out");
                Err(ToolError::TimedOut {
                    tool: name.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }
}
