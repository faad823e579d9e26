use std::fmt::Display;

/// Tab-scoped logger over the `log` facade.
///
/// `debug` lines are emitted only when the guard was configured with
/// `debug: true`; warnings always go through.
#[derive(Debug, Clone)]
pub struct TabLog {
    tag: String,
    verbose: bool,
}

impl TabLog {
    pub fn new(component: &str, tab_id: &str, verbose: bool) -> Self {
        Self {
            tag: format!("{component}:{tab_id}"),
            verbose,
        }
    }

    pub fn debug(&self, message: impl Display) {
        if self.verbose {
            log::debug!("[{}] {}", self.tag, message);
        }
    }

    pub fn warn(&self, message: impl Display) {
        log::warn!("[{}] {}", self.tag, message);
    }

    pub fn error(&self, message: impl Display) {
        log::error!("[{}] {}", self.tag, message);
    }
}
