use regex::Regex;
use std::sync::LazyLock;

/// Errors returned by the set and filter stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A batch failed. The store was restored to its pre-batch state.
    #[error("failed to apply {}: {source}", .op.as_deref().unwrap_or("batch"))]
    PartialApply {
        /// The index of the first failing operation in the batch, if it could be determined.
        index: Option<usize>,
        op: Option<String>,
        #[source]
        source: KernelError,
    },

    #[error("set {set} is still referenced by {by}")]
    ReferentialIntegrity { set: String, by: String },

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("failed to parse line {line} of {what} dump: {message}")]
    Parse {
        what: &'static str,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failure reported by a kernel primitive.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct KernelError {
    /// The 1-based line of the restore script that failed, when the primitive reports one.
    pub line: Option<usize>,
    pub message: String,
}

static LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bline:? (\d+)\b").expect("line pattern must compile")
});

// === impl KernelError ===

impl KernelError {
    /// Builds an error from a primitive's diagnostic output, recovering the failing line if the
    /// output names one (e.g. `Error in line 3: ...` or `line 7 failed`).
    pub fn from_output(message: impl Into<String>) -> Self {
        let message = message.into();
        let line = LINE
            .captures(&message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        Self {
            line,
            message: message.trim().to_string(),
        }
    }

    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_failing_line() {
        let e = KernelError::from_output(
            "ipset v7.19: Error in line 3: The set with the given name does not exist\n",
        );
        assert_eq!(e.line, Some(3));

        let e = KernelError::from_output("iptables-restore: line 12 failed\n");
        assert_eq!(e.line, Some(12));

        let e = KernelError::from_output("Another app is currently holding the xtables lock");
        assert_eq!(e.line, None);
    }
}
