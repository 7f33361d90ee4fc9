use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Rktlet error types
#[derive(Error, Debug)]
pub enum RktletError {
    /// An external command exited unsuccessfully or could not be spawned
    #[error("failed to run {subcommand} {args:?}: {message}\noutput: {}", .output.join("\n"))]
    CommandFailed {
        subcommand: String,
        args: Vec<String>,
        message: String,
        output: Vec<String>,
    },

    /// Engine output did not have the expected shape
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A bounded wait ran out before the awaited condition held
    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        /// Sandbox identifier obtained before the deadline, if any
        sandbox_id: Option<String>,
    },

    /// Request rejected without invoking the engine
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not supported by this runtime
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for RktletError {
    fn from(err: serde_json::Error) -> Self {
        RktletError::ParseError(err.to_string())
    }
}

/// Result type alias for rktlet operations
pub type Result<T> = std::result::Result<T, RktletError>;

fn already_stopped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"pod "[^"]+" is already stopped$"#).unwrap())
}

fn no_such_pod_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"cannot get pod: no matches found for "[^"]+"$"#).unwrap()
    })
}

impl RktletError {
    /// Output captured from a failed command, empty for every other variant.
    pub fn output(&self) -> &[String] {
        match self {
            RktletError::CommandFailed { output, .. } => output,
            _ => &[],
        }
    }

    /// The engine refused to stop a pod because it is not running.
    pub fn is_already_stopped(&self) -> bool {
        self.output().iter().any(|line| already_stopped_re().is_match(line))
    }

    /// The engine does not know the referenced pod.
    pub fn is_no_such_pod(&self) -> bool {
        self.output().iter().any(|line| no_such_pod_re().is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(output: &[&str]) -> RktletError {
        RktletError::CommandFailed {
            subcommand: "stop".to_string(),
            args: vec!["--force=true".to_string(), "abc".to_string()],
            message: "exit status: 254".to_string(),
            output: output.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_command_failed_display() {
        let error = failed(&["line one", "line two"]);
        assert_eq!(
            error.to_string(),
            "failed to run stop [\"--force=true\", \"abc\"]: exit status: 254\noutput: line one\nline two"
        );
    }

    #[test]
    fn test_parse_error_display() {
        let error = RktletError::ParseError("expected 1 line".to_string());
        assert_eq!(error.to_string(), "Parse error: expected 1 line");
    }

    #[test]
    fn test_timeout_display() {
        let error = RktletError::Timeout {
            message: "pod never became ready".to_string(),
            sandbox_id: Some("abc".to_string()),
        };
        assert_eq!(error.to_string(), "Timeout: pod never became ready");
    }

    #[test]
    fn test_invalid_argument_display() {
        let error = RktletError::InvalidArgument("bad id".to_string());
        assert_eq!(error.to_string(), "Invalid argument: bad id");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: RktletError = io.into();
        assert!(matches!(error, RktletError::IoError(_)));
        assert_eq!(error.to_string(), "I/O error: missing");
    }

    #[test]
    fn test_json_error_is_parse_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: RktletError = err.into();
        assert!(matches!(error, RktletError::ParseError(_)));
    }

    #[test]
    fn test_already_stopped_detection() {
        let error = failed(&[r#"pod "5f2a1e" is already stopped"#]);
        assert!(error.is_already_stopped());
        assert!(!error.is_no_such_pod());
    }

    #[test]
    fn test_no_such_pod_detection() {
        let error = failed(&[r#"stop: cannot get pod: no matches found for "5f2a1e""#]);
        assert!(error.is_no_such_pod());
        assert!(!error.is_already_stopped());
    }

    #[test]
    fn test_other_failures_not_classified() {
        let error = failed(&["stop: permission denied"]);
        assert!(!error.is_already_stopped());
        assert!(!error.is_no_such_pod());

        let error = RktletError::ParseError(r#"pod "x" is already stopped"#.to_string());
        assert!(!error.is_already_stopped());
    }
}
