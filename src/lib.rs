pub mod agent;
pub mod config;
pub mod logging;
pub mod model;
pub mod providers;
pub mod server;
pub mod service;
pub mod session;
pub mod tools;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use agent::{Agent, AgentConfig};
use config::Config;
use service::{ChatRequest, ChatService};
use session::InMemorySessionStore;
use tools::ToolSet;

const CLI_SESSION_ID: &str = "cli";
const CONNECT_TIMEOUT_SECS: u64 = 10;

pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init();

    let cfg = Config::from_env();
    info!(
        provider = %cfg.model_provider,
        model = %cfg.model,
        max_iterations = cfg.max_iterations,
        search_configured = cfg.search_api_key.is_some(),
        bind_addr = %cfg.bind_addr,
        "loaded runtime configuration"
    );

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .context("Failed to initialize HTTP client")?;

    let model = providers::from_config(&client, &cfg)?;
    let tools = Arc::new(ToolSet::builtin(&client, &cfg));
    let store = Arc::new(InMemorySessionStore::new());
    let agent = Agent::new(model, tools, store, AgentConfig::from_config(&cfg));
    let service = ChatService::new(agent);

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        server::serve(cfg.bind_addr, service).await
    } else {
        let request = ChatRequest::new(CLI_SESSION_ID, args.join(" "));
        let mut chunks = service.reply_stream(request)?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = chunks.next().await {
            write!(stdout, "{chunk}").context("failed to write reply")?;
            stdout.flush().context("failed to flush stdout")?;
        }
        writeln!(stdout).context("failed to write reply")?;
        Ok(())
    }
}
