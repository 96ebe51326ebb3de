use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::{Tool, ToolFuture, ToolSpec};

pub const CLOCK_TOOL_NAME: &str = "current_time";

/// Reports the current wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockTool;

impl ClockTool {
    /// RFC 3339 UTC timestamp followed by unix seconds.
    pub fn now() -> String {
        format_instant(Utc::now())
    }
}

fn format_instant(now: DateTime<Utc>) -> String {
    format!(
        "{} (unix: {})",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        now.timestamp()
    )
}

impl Tool for ClockTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: CLOCK_TOOL_NAME.to_string(),
            description: "Returns the current UTC date and time. Use it whenever the answer \
                          depends on today's date or the current time."
                .to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    fn execute<'a>(&'a self, _arguments: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move { Ok(Self::now()) })
    }
}
