use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

const DEFAULT_LOG_FILTER: &str = "warn,cipriano=info";
const DEFAULT_LOG_FILE_PATH: &str = "logs/cipriano.log";
const DEFAULT_LOG_FILE_NAME: &str = "cipriano.log";

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    File,
    Both,
}

impl LogOutput {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stderr => "stderr",
            Self::File => "file",
            Self::Both => "both",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LogSettings {
    format: LogFormat,
    output: LogOutput,
    file_path: PathBuf,
}

impl LogSettings {
    fn from_env_with(mut get_var: impl FnMut(&str) -> Option<String>) -> Self {
        Self {
            format: parse_log_format(get_var("LOG_FORMAT").as_deref()),
            output: parse_log_output(get_var("LOG_OUTPUT").as_deref()),
            file_path: parse_log_file_path(get_var("LOG_FILE_PATH").as_deref()),
        }
    }
}

fn normalized(raw: Option<&str>) -> String {
    raw.unwrap_or_default().trim().to_ascii_lowercase()
}

fn parse_log_format(raw: Option<&str>) -> LogFormat {
    match normalized(raw).as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn parse_log_output(raw: Option<&str>) -> LogOutput {
    match normalized(raw).as_str() {
        "file" => LogOutput::File,
        "both" => LogOutput::Both,
        _ => LogOutput::Stderr,
    }
}

fn parse_log_file_path(raw: Option<&str>) -> PathBuf {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE_PATH))
}

fn rolling_file_writer(path: &Path) -> std::io::Result<(non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| OsStr::new(DEFAULT_LOG_FILE_NAME));

    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn install(format: LogFormat, writer: BoxMakeWriter) -> InitResult {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer);
    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}

/// Builds the writer for `settings`, falling back to stderr when the log file
/// cannot be prepared. The returned guard must outlive the subscriber.
fn writer_for(settings: &LogSettings) -> (BoxMakeWriter, Option<WorkerGuard>) {
    if settings.output == LogOutput::Stderr {
        return (BoxMakeWriter::new(std::io::stderr), None);
    }

    match rolling_file_writer(&settings.file_path) {
        Ok((file_writer, guard)) => {
            let writer = if settings.output == LogOutput::Both {
                BoxMakeWriter::new(std::io::stderr.and(file_writer))
            } else {
                BoxMakeWriter::new(file_writer)
            };
            (writer, Some(guard))
        }
        Err(err) => {
            let fallback = match settings.output {
                LogOutput::Both => "using stderr only",
                _ => "using stderr instead",
            };
            eprintln!(
                "cipriano: failed to initialize LOG_OUTPUT={} at '{}': {}; {}",
                settings.output.as_str(),
                settings.file_path.display(),
                err,
                fallback
            );
            (BoxMakeWriter::new(std::io::stderr), None)
        }
    }
}

/// Installs the global subscriber from `LOG_FORMAT`, `LOG_OUTPUT`,
/// `LOG_FILE_PATH` and `RUST_LOG`. Calling it twice is a no-op.
///
/// File output is flushed when the returned guard is dropped, so keep it
/// alive for as long as the process logs.
#[must_use = "dropping the guard stops file logging"]
pub fn init() -> Option<WorkerGuard> {
    let settings = LogSettings::from_env_with(|key| env::var(key).ok());
    let (writer, guard) = writer_for(&settings);

    match install(settings.format, writer) {
        Ok(()) => guard,
        Err(_) => None,
    }
}
