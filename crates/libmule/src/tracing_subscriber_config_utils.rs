use std::io::LineWriter;

use anyhow::Context;
use libmule_core::spawn_utils::spawn;
use tracing::error_span;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub struct InitLoggingOptions<'a> {
    /// Used when RUST_LOG is not set. Defaults to "info".
    pub default_rust_log_value: Option<&'a str>,
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
    /// One JSON object per line on stderr instead of the human format.
    pub json: bool,
}

pub struct InitLoggingResult {
    /// Send a new RUST_LOG value here to change the stderr filter at runtime.
    pub rust_log_reload_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

/// Installs the global subscriber. Must be called from within a tokio runtime.
#[inline(never)]
pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<InitLoggingResult> {
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(
            opts.default_rust_log_value
                .unwrap_or("info")
                .parse()
                .context("can't parse provided rust_log value")?,
        )
        .from_env()
        .context("invalid RUST_LOG value")?;

    let (stderr_filter, reload_stderr_filter) = tracing_subscriber::reload::Layer::new(stderr_filter);

    let stderr_layer = if opts.json {
        fmt::layer()
            .with_ansi(false)
            .fmt_fields(fmt::format::JsonFields::new())
            .event_format(fmt::format().with_ansi(false).json())
            .with_writer(std::io::stderr)
            .with_filter(stderr_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(stderr_filter)
            .boxed()
    };
    let layered = tracing_subscriber::registry().with(stderr_layer);

    if let Some(log_file) = &opts.log_file {
        let log_file = log_file.to_string();
        let log_file = std::sync::Mutex::new(LineWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("error opening log file {log_file:?}"))?,
        ));
        layered
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(
                        EnvFilter::builder()
                            .parse(opts.log_file_rust_log.unwrap_or("info,libmule=debug"))
                            .context("can't parse log-file-rust-log")?,
                    ),
            )
            .try_init()
            .context("can't init logging")?;
    } else {
        layered.try_init().context("can't init logging")?;
    }

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    spawn(error_span!("fmt_filter_reloader"), async move {
        while let Some(rust_log) = reload_rx.recv().await {
            let stderr_env_filter = match EnvFilter::builder().parse(&rust_log) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("can't parse env filter {rust_log:?}: {e:#?}");
                    continue;
                }
            };
            eprintln!("setting RUST_LOG to {rust_log:?}");
            let _ = reload_stderr_filter.reload(stderr_env_filter);
        }
        Ok(())
    });
    Ok(InitLoggingResult {
        rust_log_reload_tx: reload_tx,
    })
}
