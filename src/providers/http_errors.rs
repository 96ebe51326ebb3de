use reqwest::StatusCode;
use std::error::Error as StdError;
use std::io::ErrorKind;

use crate::model::ProviderError;

const MAX_ERROR_BODY_CHARS: usize = 512;

fn error_chain_has(
    err: &(dyn StdError + 'static),
    kind: ErrorKind,
    needle: &str,
) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(source) = current {
        if let Some(io_err) = source.downcast_ref::<std::io::Error>()
            && io_err.kind() == kind
        {
            return true;
        }

        if source.to_string().to_ascii_lowercase().contains(needle) {
            return true;
        }

        current = source.source();
    }

    false
}

fn error_chain_has_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    error_chain_has(err, ErrorKind::ConnectionRefused, "connection refused")
}

fn error_chain_has_timeout(err: &(dyn StdError + 'static)) -> bool {
    error_chain_has(err, ErrorKind::TimedOut, "timed out")
}

/// Turns a transport failure into an actionable provider error.
pub(crate) fn model_api_request_error(
    err: reqwest::Error,
    api_url: &str,
    timeout_secs: u64,
) -> ProviderError {
    if err.is_timeout() || error_chain_has_timeout(&err) {
        return ProviderError::Timeout(format!(
            "Model request timed out after {timeout_secs}s while calling '{api_url}'. \
             Increase MODEL_TIMEOUT_SECS or check model responsiveness."
        ));
    }

    if err.is_connect() {
        if error_chain_has_connection_refused(&err) {
            return ProviderError::Network(format!(
                "Connection refused by model API at '{api_url}'. \
                 Ensure the model provider is running and MODEL_BASE_URL is correct."
            ));
        }

        return ProviderError::Network(format!(
            "Failed to connect to model API at '{api_url}'. \
             Check MODEL_BASE_URL and network connectivity."
        ));
    }

    ProviderError::Network(format!("Failed to call model API at '{api_url}': {err}"))
}

/// Maps a non-success status and its body onto the provider taxonomy.
pub(crate) fn model_api_status_error(status: StatusCode, body: &str) -> ProviderError {
    let body = truncate(body.trim(), MAX_ERROR_BODY_CHARS);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(body),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        _ => ProviderError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
