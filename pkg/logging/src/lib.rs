//! Process logging shared by the plugin and the controller.
//!
//! Every line is written as `LEVEL: date time file:line: message`, appended
//! to a fixed log file and mirrored to stdout.

use chrono::NaiveDateTime;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Event formatter producing the plugin log line layout.
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let now = chrono::Local::now().naive_local();
        write!(writer, "{}", line_prefix(meta.level(), meta.file(), meta.line(), now))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// `LEVEL: YYYY/MM/DD HH:MM:SS file.rs:LINE: `
fn line_prefix(level: &Level, file: Option<&str>, line: Option<u32>, at: NaiveDateTime) -> String {
    let file = file
        .and_then(|f| Path::new(f).file_name())
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{}: {} {}:{}: ",
        level,
        at.format("%Y/%m/%d %H:%M:%S"),
        file,
        line.unwrap_or(0)
    )
}

/// Install the global subscriber: stdout plus an append-only `log_file`.
///
/// Failing to open the log file is fatal for the caller, since nothing could
/// be reported otherwise.
pub fn init(log_file: &str) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", log_file, e))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(std::io::stdout),
        )
        .with(
            fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}
