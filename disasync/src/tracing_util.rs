use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Output formats for logging messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Standard, human readable format.
    Raw,
    /// JSON, machine readable format.
    Json,
}

/// Initialize tracing and enable logging messages according to these options.
///
/// When `dir` is given, every message is additionally appended in JSON to
/// `disasync-relay.log` inside it, regardless of `format`.
pub fn init(level_filter: LevelFilter, format: Format, dir: Option<&Path>) -> Result<()> {
    let file_layer = match dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, "disasync-relay.log");
            Some(
                fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_target(false)
                    .json()
                    .with_filter(env_filter(level_filter)?),
            )
        }
        None => None,
    };

    let is_terminal = atty::is(atty::Stream::Stderr);
    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    let env_filtered = env_filter(level_filter)?;
    let final_terminal_layer = match format {
        Format::Json => terminal_layer.json().with_filter(env_filtered).boxed(),
        Format::Raw => terminal_layer.with_filter(env_filtered).boxed(),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(final_terminal_layer)
        .try_init()?;

    tracing::info!(%level_filter, logs_dir = ?dir, "Initialized tracing");

    Ok(())
}

/// This function controls which crate's logs actually get logged and from which level.
fn env_filter(level_filter: LevelFilter) -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive(Directive::from_str(&format!("disasync={}", &level_filter))?)
        .add_directive(Directive::from_str(&format!("disasync_server={}", &level_filter))?))
}
