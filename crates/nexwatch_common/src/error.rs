//! Error types for nexwatch.

use std::time::Duration;
use thiserror::Error;

/// Failure of an external OS command.
///
/// A non-zero exit is only an error once the caller asks for it through
/// `CommandOutput::into_result`; the runner itself hands back the output.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("{program} timed out after {}ms", .after.as_millis())]
    Timeout { program: String, after: Duration },

    #[error("{program} exited with {}: {detail}", exit_label(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Short text recorded in hop history and recovery details.
    pub fn summary(&self) -> String {
        match self {
            CommandError::Timeout { .. } => "timeout".to_string(),
            CommandError::NonZeroExit { detail, code, .. } if detail.is_empty() => {
                format!("exit status {}", code.unwrap_or(-1))
            }
            CommandError::NonZeroExit { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("rule {name}: invalid pattern: {message}")]
    InvalidPattern { name: String, message: String },

    #[error("rule {name}: minimum occurrences must be at least 1")]
    ZeroThreshold { name: String },
}

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display socket {path} unavailable: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("display socket write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("display daemon did not accept the connection within {}ms", .0.as_millis())]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_summary() {
        let err = CommandError::Timeout {
            program: "iw".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_timeout());
        assert_eq!(err.summary(), "timeout");
        assert_eq!(err.to_string(), "iw timed out after 5000ms");
    }

    #[test]
    fn test_non_zero_exit_summary_prefers_detail() {
        let err = CommandError::NonZeroExit {
            program: "iw".to_string(),
            code: Some(240),
            detail: "command failed: Connection timed out (-110)".to_string(),
        };
        assert_eq!(err.summary(), "command failed: Connection timed out (-110)");

        let bare = CommandError::NonZeroExit {
            program: "modprobe".to_string(),
            code: Some(1),
            detail: String::new(),
        };
        assert_eq!(bare.summary(), "exit status 1");
    }
}
