//! Telemetry helpers: event formatting for sinks and tracing initialization.
//!
//! Sinks that render events for humans go through a [`TelemetryFormatter`];
//! the provided [`PlainFormatter`] colorizes by event kind when the output is
//! a terminal and degrades to plain text otherwise.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::event_bus::Event;

pub const SCOPE_COLOR: &str = "\x1b[32m"; // green
pub const BREAKER_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Controls whether ANSI color codes appear in formatted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Detect TTY capability via `stderr.is_terminal()`.
    #[default]
    Auto,
    /// Always emit color codes.
    Colored,
    /// Never emit color codes (log files, pipes).
    Plain,
}

impl FormatterMode {
    #[must_use]
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Renders events into the line a sink writes.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> String;
}

/// Plain text formatter with optional ANSI colors per [`FormatterMode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> String {
        let scope = event.scope_label();
        if self.mode.is_colored() {
            let color = match event {
                Event::Breaker(_) => BREAKER_COLOR,
                _ => SCOPE_COLOR,
            };
            format!("{color}[{scope}]{RESET_COLOR} {event}\n")
        } else {
            format!("[{scope}] {event}\n")
        }
    }
}

/// Install a global tracing subscriber honoring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reelforge=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mode_has_no_ansi_codes() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let rendered = formatter.render_event(&Event::diagnostic("startup", "ready"));
        assert!(!rendered.contains("\x1b["));
        assert!(rendered.starts_with("[startup]"));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn colored_mode_wraps_scope() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Colored);
        let rendered = formatter.render_event(&Event::diagnostic("startup", "ready"));
        assert!(rendered.contains(SCOPE_COLOR));
        assert!(rendered.contains(RESET_COLOR));
    }
}
