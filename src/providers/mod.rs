pub mod gemini;
mod http_errors;
pub mod ollama;
mod stream;

use anyhow::{Result, anyhow};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{ModelClient, ModelDelta, ModelReply};

pub use gemini::GeminiClient;
pub use ollama::OllamaClient;

/// Builds the model client named by `MODEL_PROVIDER`.
///
/// Only the provider name is checked here; credentials are validated on the
/// first model call.
pub fn from_config(client: &Client, cfg: &Config) -> Result<Arc<dyn ModelClient>> {
    let provider = cfg.model_provider.trim().to_ascii_lowercase();

    match provider.as_str() {
        "gemini" | "google" => {
            let mut gemini = GeminiClient::new(client.clone(), cfg.model_api_key.clone(), &cfg.model)
                .with_timeout_secs(cfg.model_timeout_secs);
            if let Some(base_url) = &cfg.model_base_url {
                gemini = gemini.with_base_url(base_url);
            }
            if let Some(vision) = cfg.model_vision {
                gemini = gemini.with_vision(vision);
            }
            debug!(provider = "gemini", model = %cfg.model, "configured model client");
            Ok(Arc::new(gemini))
        }
        "ollama" => {
            let mut ollama =
                OllamaClient::new(client.clone(), &cfg.model).with_timeout_secs(cfg.model_timeout_secs);
            if let Some(base_url) = &cfg.model_base_url {
                ollama = ollama.with_base_url(base_url);
            }
            if let Some(vision) = cfg.model_vision {
                ollama = ollama.with_vision(vision);
            }
            debug!(provider = "ollama", model = %cfg.model, "configured model client");
            Ok(Arc::new(ollama))
        }
        other => {
            warn!(provider = %other, "unsupported model provider configured");
            Err(anyhow!(
                "Unsupported MODEL_PROVIDER='{}'. Supported providers: gemini, ollama.",
                other
            ))
        }
    }
}

/// Folds deltas into one reply; the first tool call wins over any text.
pub(crate) fn collapse_deltas(deltas: Vec<ModelDelta>) -> ModelReply {
    let mut text = String::new();
    for delta in deltas {
        match delta {
            ModelDelta::Text(fragment) => text.push_str(&fragment),
            ModelDelta::ToolCall {
                name,
                arguments,
                signature,
            } => {
                return ModelReply::ToolCall {
                    name,
                    arguments,
                    signature,
                };
            }
        }
    }
    ModelReply::Text(text)
}
