use futures::StreamExt;
use futures::stream::BoxStream;

use crate::model::ProviderError;

/// Splits a streaming response body into trimmed, non-empty lines.
///
/// Bytes are buffered until a newline arrives so multi-byte characters split
/// across chunks decode correctly.
pub(crate) fn response_lines(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, ProviderError>> {
    let bytes = response.bytes_stream();

    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut interrupted = false;
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(ProviderError::Network(format!("model stream interrupted: {err}")));
                    interrupted = true;
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);
            for line in drain_lines(&mut buffer) {
                yield Ok(line);
            }
        }

        if !interrupted {
            let rest = String::from_utf8_lossy(&buffer).trim().to_string();
            if !rest.is_empty() {
                yield Ok(rest);
            }
        }
    }
    .boxed()
}

/// Removes every complete line from `buffer`, leaving any partial tail.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Payload of an SSE `data:` line; `None` for other fields and `[DONE]`.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(str::trim_start)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
}
