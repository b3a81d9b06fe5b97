//! Name-scoped logging handle.

use std::fmt;
use std::sync::Arc;

use tracing::Span;

/// A qualified, dot-separated name plus the tracing span that carries it.
///
/// Services receive a logger from their parent and derive their own with
/// [`Logger::named`], so names are unique relative to the tree.
#[derive(Clone, Debug)]
pub struct Logger {
    name: Arc<str>,
    span: Span,
}

impl Default for Logger {
    fn default() -> Self {
        Self::root()
    }
}

impl Logger {
    /// The unnamed root logger.
    #[must_use]
    pub fn root() -> Self {
        Self {
            name: Arc::from(""),
            span: Span::current(),
        }
    }

    /// Derives a child logger named `<self>.<name>`, or just `<name>` from the root.
    #[must_use]
    pub fn named(&self, name: &str) -> Self {
        let qualified = if self.name.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.name)
        };

        let span = tracing::info_span!(parent: &self.span, "service", service = %qualified);

        Self {
            name: Arc::from(qualified),
            span,
        }
    }

    /// The qualified name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The span every event from this logger is attached to.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Logs at debug level.
    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(parent: &self.span, logger = %self.name, "{message}");
    }

    /// Logs at info level.
    pub fn info(&self, message: impl fmt::Display) {
        tracing::info!(parent: &self.span, logger = %self.name, "{message}");
    }

    /// Logs at warn level.
    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!(parent: &self.span, logger = %self.name, "{message}");
    }

    /// Logs at error level.
    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(parent: &self.span, logger = %self.name, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_qualifies_from_parent() {
        let root = Logger::root();
        assert_eq!(root.name(), "");

        let parent = root.named("root");
        let child = parent.named("childA");

        assert_eq!(parent.name(), "root");
        assert_eq!(child.name(), "root.childA");
        assert_eq!(child.named("leaf").name(), "root.childA.leaf");
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_events_carry_logger_name() {
        let logger = Logger::root().named("poller");
        logger.info("polling");

        assert!(logs_contain("polling"));
        assert!(logs_contain("poller"));
    }
}
