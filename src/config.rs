use std::env;
use std::fmt;
use std::net::SocketAddr;

const DEFAULT_MODEL_PROVIDER: &str = "gemini";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5:3b";
const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TEMPERATURE: f32 = 0.0;
const MAX_TEMPERATURE: f32 = 2.0;
const DEFAULT_MAX_ITERATIONS: u32 = 6;
const DEFAULT_SEARCH_BASE_URL: &str = "https://api.tavily.com";
const DEFAULT_SEARCH_MAX_RESULTS: u32 = 3;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Cipriano, a strategic intelligence and security agent \
with the presence, authority and calculated calm of Don Corleone.

- Be direct.
- Do not invent data.
- Use web search for current facts.
- Act only in legal and ethical contexts.";

#[derive(Clone)]
pub struct Config {
    pub model_provider: String,
    pub model: String,
    pub model_base_url: Option<String>,
    pub model_api_key: Option<String>,
    /// `None` lets the provider decide whether images are accepted.
    pub model_vision: Option<bool>,
    pub model_timeout_secs: u64,
    pub temperature: f32,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub search_api_key: Option<String>,
    pub search_base_url: String,
    pub search_max_results: u32,
    pub tool_timeout_secs: u64,
    pub bind_addr: SocketAddr,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("model_provider", &self.model_provider)
            .field("model", &self.model)
            .field("model_base_url", &self.model_base_url)
            .field("model_api_key", &redacted(&self.model_api_key))
            .field("model_vision", &self.model_vision)
            .field("model_timeout_secs", &self.model_timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_iterations", &self.max_iterations)
            .field("search_api_key", &redacted(&self.search_api_key))
            .field("search_base_url", &self.search_base_url)
            .field("search_max_results", &self.search_max_results)
            .field("tool_timeout_secs", &self.tool_timeout_secs)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

fn redacted(secret: &Option<String>) -> &'static str {
    match secret {
        Some(_) => "[REDACTED]",
        None => "<unset>",
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_env_with(|key| env::var(key).ok())
    }

    pub(crate) fn from_env_with(mut get_var: impl FnMut(&str) -> Option<String>) -> Self {
        let model_provider = get_var("MODEL_PROVIDER")
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL_PROVIDER.to_string());
        let model = non_empty(get_var("MODEL"))
            .unwrap_or_else(|| default_model_for(&model_provider).to_string());
        let model_api_key = first_non_empty(
            &mut get_var,
            &["MODEL_API_KEY", "GOOGLE_API_KEY", "GEMINI_API_KEY"],
        );

        Self {
            model,
            model_base_url: non_empty(get_var("MODEL_BASE_URL")),
            model_api_key,
            model_vision: parse_vision(get_var("MODEL_VISION").as_deref()),
            model_timeout_secs: parse_positive_u64(
                get_var("MODEL_TIMEOUT_SECS").as_deref(),
                DEFAULT_MODEL_TIMEOUT_SECS,
            ),
            temperature: parse_temperature(get_var("MODEL_TEMPERATURE").as_deref()),
            system_prompt: get_var("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_iterations: parse_positive_u64(
                get_var("AGENT_MAX_ITERATIONS").as_deref(),
                u64::from(DEFAULT_MAX_ITERATIONS),
            )
            .try_into()
            .unwrap_or(DEFAULT_MAX_ITERATIONS),
            search_api_key: non_empty(get_var("TAVILY_API_KEY")),
            search_base_url: non_empty(get_var("SEARCH_BASE_URL"))
                .unwrap_or_else(|| DEFAULT_SEARCH_BASE_URL.to_string()),
            search_max_results: parse_positive_u64(
                get_var("SEARCH_MAX_RESULTS").as_deref(),
                u64::from(DEFAULT_SEARCH_MAX_RESULTS),
            )
            .try_into()
            .unwrap_or(DEFAULT_SEARCH_MAX_RESULTS),
            tool_timeout_secs: parse_positive_u64(
                get_var("TOOL_TIMEOUT_SECS").as_deref(),
                DEFAULT_TOOL_TIMEOUT_SECS,
            ),
            bind_addr: parse_bind_addr(get_var("BIND_ADDR").as_deref()),
            model_provider,
        }
    }
}

fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "ollama" => DEFAULT_OLLAMA_MODEL,
        _ => DEFAULT_GEMINI_MODEL,
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn first_non_empty(
    get_var: &mut impl FnMut(&str) -> Option<String>,
    keys: &[&str],
) -> Option<String> {
    keys.iter().find_map(|key| non_empty(get_var(key)))
}

fn parse_positive_u64(raw: Option<&str>, default: u64) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_temperature(raw: Option<&str>) -> f32 {
    raw.and_then(|value| value.trim().parse::<f32>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, MAX_TEMPERATURE))
        .unwrap_or(DEFAULT_TEMPERATURE)
}

fn parse_bool(raw: Option<&str>) -> Option<bool> {
    match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => Some(true),
        Some("0" | "false" | "no" | "off") => Some(false),
        _ => None,
    }
}

fn parse_vision(raw: Option<&str>) -> Option<bool> {
    // "auto" and anything unrecognised defer to the provider.
    parse_bool(raw)
}

fn parse_bind_addr(raw: Option<&str>) -> SocketAddr {
    raw.and_then(|value| value.trim().parse::<SocketAddr>().ok())
        .unwrap_or_else(|| {
            DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or(SocketAddr::from(([127, 0, 0, 1], 8000)))
        })
}
