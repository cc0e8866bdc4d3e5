// ABOUTME: Diagnostics accumulator for non-fatal warnings during teardown.
// ABOUTME: Collects failures that close() swallows so callers can still inspect them.

/// Collects non-fatal warnings.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Forget everything recorded so far.
    pub fn clear(&mut self) {
        self.warnings.clear();
    }
}

/// A non-fatal warning.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// Create a forwarding session close warning.
    pub fn forwarding_close(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::ForwardingClose,
            message: message.into(),
        }
    }

    /// Create an SSH disconnect warning.
    pub fn disconnect(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Disconnect,
            message: message.into(),
        }
    }
}

/// Categories of warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Failed to close the agent forwarding session.
    ForwardingClose,
    /// Failed to cleanly disconnect the SSH connection.
    Disconnect,
}
