//! Stderr logger that tags each line with the pipeline stage and the frame
//! being processed.
//!
//! Lines read `[elapsed LEVEL stage frame] message`. The stage comes from the
//! emitting module; the frame from the innermost [`FrameScope`] open on the
//! calling thread, so parallel per-frame detection stays attributable. With
//! the `tracing` feature, [`init_tracing`] installs a `tracing-subscriber`
//! formatter instead.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::EnvFilter;

thread_local! {
    static FRAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Frame tag for log lines emitted on this thread until dropped.
#[must_use = "the frame tag is removed when the scope is dropped"]
pub struct FrameScope {
    previous: Option<String>,
}

impl FrameScope {
    pub fn enter(name: impl Into<String>) -> Self {
        let previous = FRAME.with(|f| f.replace(Some(name.into())));
        Self { previous }
    }
}

impl Drop for FrameScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        FRAME.with(|f| *f.borrow_mut() = previous);
    }
}

/// Frame tag of the innermost open [`FrameScope`] on this thread.
pub fn current_frame() -> Option<String> {
    FRAME.with(|f| f.borrow().clone())
}

/// Pipeline stage a log target belongs to.
fn stage_of(target: &str) -> &str {
    match target.rsplit("::").next().unwrap_or(target) {
        "blob" | "patch" => "extract",
        "filters" => "filter",
        "subpix" | "corners" => "corners",
        "detector" => "find",
        "coverage" | "optimizer" | "culling" => "select",
        other => other,
    }
}

fn format_line(
    elapsed: f64,
    level: log::Level,
    target: &str,
    frame: Option<&str>,
    args: &fmt::Arguments<'_>,
) -> String {
    match frame {
        Some(frame) => format!(
            "[{:7.3}s {:>5} {} {}] {}",
            elapsed,
            level,
            stage_of(target),
            frame,
            args
        ),
        None => format!("[{:7.3}s {:>5} {}] {}", elapsed, level, stage_of(target), args),
    }
}

struct StageLogger {
    level: LevelFilter,
    started: Instant,
}

impl Log for StageLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = FRAME.with(|f| {
            format_line(
                self.started.elapsed().as_secs_f64(),
                record.level(),
                record.target(),
                f.borrow().as_deref(),
                record.args(),
            )
        });
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<StageLogger> = OnceLock::new();

/// Install the stage logger at `level`. Later calls keep the first level.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = LOGGER.get_or_init(|| StageLogger {
        level,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Thread names are printed since frames are detected on worker threads;
/// the per-frame span carries the frame name and span close events carry
/// the stage timings.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_names(true);
    let _ = if json {
        builder.json().with_current_span(true).finish().try_init()
    } else {
        builder.compact().finish().try_init()
    };
}
