use std::fmt;

/// Classification of a failure, used by the orchestrator to decide which
/// step a record moves to and by the CLI to pick an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unreachable,
    Authentication,
    EmptyCapture,
    IncompleteCapture,
    Provisioning,
    Interrupted,
    Cancelled,
    State,
    Config,
    Dependency,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Authentication => "authentication",
            ErrorKind::EmptyCapture => "empty-capture",
            ErrorKind::IncompleteCapture => "incomplete-capture",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::State => "state",
            ErrorKind::Config => "config",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Other => "other",
        }
    }

    pub fn is_capture(self) -> bool {
        matches!(self, ErrorKind::EmptyCapture | ErrorKind::IncompleteCapture)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn unreachable<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Unreachable, msg)
    }

    pub fn provisioning<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Provisioning, msg)
    }

    pub fn state<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::State, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted, "interrupted")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Re-tag an error while keeping its message, prefixed with `context`.
    pub fn context(self, context: &str) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{context}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::state(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let e = Error::provisioning("pct create exited 2").context("lxc");
        assert_eq!(e.kind(), ErrorKind::Provisioning);
        assert_eq!(e.to_string(), "lxc: pct create exited 2");
    }

    #[test]
    fn io_errors_are_other() {
        let e: Error = std::io::Error::other("disk full").into();
        assert_eq!(e.kind(), ErrorKind::Other);
        assert!(!e.kind().is_capture());
    }
}
