use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Tool, ToolError, ToolFuture, ToolOutcome, ToolSpec, render_outcome, string_argument};
use crate::config::Config;

pub const SEARCH_TOOL_NAME: &str = "search_web";

/// Web search over the Tavily API.
///
/// Every failure is returned as text so the agent can reason about it rather
/// than abort the turn.
#[derive(Debug, Clone)]
pub struct SearchTool {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    max_results: u32,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

impl SearchTool {
    pub fn new(client: Client, api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.into(),
            max_results: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(client: Client, cfg: &Config) -> Self {
        Self::new(client, cfg.search_api_key.clone(), cfg.search_base_url.clone())
            .with_max_results(cfg.search_max_results)
            .with_timeout(Duration::from_secs(cfg.tool_timeout_secs))
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a search and always yields readable text.
    pub async fn search(&self, query: &str) -> String {
        render_outcome(&self.try_search(query).await)
    }

    async fn try_search(&self, query: &str) -> ToolOutcome {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: SEARCH_TOOL_NAME.to_string(),
                reason: "the search query is empty".to_string(),
            });
        }
        let Some(api_key) = self.api_key.as_deref() else {
            warn!("web search requested without TAVILY_API_KEY");
            return Err(ToolError::Failed(
                "web search is unavailable: TAVILY_API_KEY is not configured".to_string(),
            ));
        };

        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        debug!(api_url = %url, max_results = self.max_results, "sending web search request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&SearchRequest {
                query,
                max_results: self.max_results,
            })
            .send()
            .await
            .map_err(|err| {
                warn!(api_url = %url, error = %err, "web search request failed");
                ToolError::Failed(format!("web search failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(api_url = %url, status = %status, "web search returned non-success status");
            return Err(ToolError::Failed(format!(
                "web search failed with status {status}"
            )));
        }

        let parsed: SearchResponse = response.json().await.map_err(|err| {
            ToolError::Failed(format!("web search returned an unreadable response: {err}"))
        })?;
        debug!(hits = parsed.results.len(), "received web search results");
        Ok(format_hits(query, &parsed.results))
    }
}

fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No web results found for '{query}'.");
    }

    hits.iter()
        .enumerate()
        .map(|(idx, hit)| {
            format!(
                "{}. {}\n{}\n{}",
                idx + 1,
                hit.title.trim(),
                hit.url.trim(),
                hit.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl Tool for SearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: SEARCH_TOOL_NAME.to_string(),
            description: "Searches the public web for current information. Use it for recent \
                          events, facts that may have changed, or anything you are not sure of."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to search for"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    fn execute<'a>(&'a self, arguments: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let query = string_argument(SEARCH_TOOL_NAME, arguments, "query")?;
            self.try_search(&query).await
        })
    }
}
