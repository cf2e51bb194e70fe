use crate::CoreError;
use tracing::{error, info, warn, Span};

/// What [`BundleLogger::fatal`] does after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalMode {
    /// Terminate the process with exit status 1.
    #[default]
    Exit,
    /// Return [`CoreError::Fatal`] so a harness can observe it.
    Raise,
}

/// Logger owned by one orchestrator instance.
///
/// Every event is emitted inside a `bundle` span carrying the bundle's
/// versioned name. Distinct error and warning messages are kept so they can
/// be reported once the run ends.
#[derive(Debug)]
pub struct BundleLogger {
    span: Span,
    mode: FatalMode,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl BundleLogger {
    pub fn new(vname: &str, mode: FatalMode) -> Self {
        Self {
            span: tracing::info_span!("bundle", name = %vname),
            mode,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn mode(&self) -> FatalMode {
        self.mode
    }

    pub fn info(&self, message: &str) {
        let _guard = self.span.enter();
        info!("{message}");
    }

    pub fn warn(&mut self, message: &str) {
        {
            let _guard = self.span.enter();
            warn!("{message}");
        }
        if !self.warnings.iter().any(|w| w == message) {
            self.warnings.push(message.to_owned());
        }
    }

    pub fn error(&mut self, message: &str) {
        {
            let _guard = self.span.enter();
            error!("{message}");
        }
        if !self.errors.iter().any(|e| e == message) {
            self.errors.push(message.to_owned());
        }
    }

    /// Log `message` at error level, then either exit the process or hand
    /// back a [`CoreError::Fatal`] for the caller to return.
    pub fn fatal(&mut self, message: &str) -> CoreError {
        self.error(&format!("fatal: {message}"));
        if self.mode == FatalMode::Exit {
            std::process::exit(1);
        }
        CoreError::Fatal(message.to_owned())
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_deduplicated() {
        let mut log = BundleLogger::new("example.com-rates-r1", FatalMode::Raise);
        log.error("table x has no description");
        log.error("table x has no description");
        log.error("table y has no description");
        log.warn("slow");
        assert_eq!(log.errors().len(), 2);
        assert_eq!(log.warnings(), ["slow"]);
    }

    #[test]
    fn fatal_raises_in_harness_mode() {
        let mut log = BundleLogger::new("b", FatalMode::Raise);
        let err = log.fatal("dependency missing");
        assert!(matches!(err, CoreError::Fatal(ref m) if m == "dependency missing"));
        assert_eq!(log.errors(), ["fatal: dependency missing"]);
    }
}
