//! Logger handle passed explicitly to each component
//!
//! All records go through the [log] facade, so the binary decides where they
//! end up (see `env_logger` setup in `src/bin/ocmirror.rs`). The handle only
//! carries the log target and the formatting options.

use log::Level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger {
    target: String,
    truncate_at_newline: bool,
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new("ocmirror")
    }
}

impl Logger {
    pub fn new(target: &str) -> Self {
        Logger {
            target: target.to_string(),
            truncate_at_newline: false,
        }
    }

    /// Split multi-line messages into one record per line.
    pub fn with_newline_truncate(mut self, truncate: bool) -> Self {
        self.truncate_at_newline = truncate;
        self
    }

    /// Derive a handle for a sub-component, e.g. `ocmirror::publish`
    pub fn child(&self, name: &str) -> Self {
        Logger {
            target: format!("{}::{}", self.target, name),
            truncate_at_newline: self.truncate_at_newline,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, msg: &str) {
        if !log::log_enabled!(target: self.target.as_str(), level) {
            return;
        }
        if self.truncate_at_newline {
            for line in msg.lines() {
                log::log!(target: self.target.as_str(), level, "{}", line);
            }
        } else {
            log::log!(target: self.target.as_str(), level, "{}", msg);
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(Level::Error, msg.as_ref())
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(Level::Warn, msg.as_ref())
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(Level::Info, msg.as_ref())
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.log(Level::Debug, msg.as_ref())
    }

    pub fn is_debug(&self) -> bool {
        log::log_enabled!(target: self.target.as_str(), Level::Debug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_target() {
        let logger = Logger::default().with_newline_truncate(true);
        let child = logger.child("publish");
        assert_eq!(child.target(), "ocmirror::publish");
        assert_eq!(child, logger.child("publish"));
        // No logger is installed in tests, these must be no-op
        child.info("first\nsecond");
        child.debug("debug");
    }
}
