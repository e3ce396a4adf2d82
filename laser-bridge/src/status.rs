//! Leveled status reporting.
//!
//! The bridge reports operator-facing events (listening, sessions opened and
//! closed, link failures) through a [`StatusSink`].  Embedders can route them
//! to a UI; the binary uses [`LogStatus`].

/// Receiver of operator-facing status lines.
pub trait StatusSink: Send + Sync {
    /// Something the operator asked for has happened.
    fn ok(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
    fn debug(&self, msg: &str);
}

/// Forwards status lines to the `log` facade under the `status` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn ok(&self, msg: &str) {
        log::info!(target: "status", "ok: {msg}");
    }

    fn info(&self, msg: &str) {
        log::info!(target: "status", "{msg}");
    }

    fn warn(&self, msg: &str) {
        log::warn!(target: "status", "{msg}");
    }

    fn error(&self, msg: &str) {
        log::error!(target: "status", "{msg}");
    }

    fn debug(&self, msg: &str) {
        log::debug!(target: "status", "{msg}");
    }
}
