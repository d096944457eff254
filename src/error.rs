use std::fmt;

use backtrace::Backtrace as CallStack;
use log::error;
use thiserror::Error;

/// The closed set of failure kinds surfaced by the database.
///
/// Every public fallible API reports one of these kinds. Callers may branch
/// on the kind (e.g. `NotFound`), but errors are never used as control flow
/// inside hot loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    InvalidParam,
    NotFound,
    BufferFull,
    PermissionDenied,
    Parse,
    Semantic,
    Expression,
    ConstraintViolation,
    Unsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "IoError",
            ErrorKind::InvalidParam => "InvalidParam",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::BufferFull => "BufferFull",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Semantic => "SemanticError",
            ErrorKind::Expression => "ExpressionError",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::Unsupported => "UnsupportedFeature",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A position in the source text of a statement, attached by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: u64,
    pub column: u64,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SmallError {
    pub kind: ErrorKind,
    message: String,
    location: Option<Location>,
    trace: CallStack,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> Self {
        Self {
            kind,
            message: msg.to_string(),
            location: None,
            trace: CallStack::new_unresolved(),
        }
    }

    pub fn with_location(mut self, line: u64, column: u64) -> Self {
        self.location = Some(Location { line, column });
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// The single-line form shown to users: kind, message, and the source
    /// location when the front-end attached one.
    pub fn diagnostic(&self) -> String {
        match self.location {
            Some(loc) => format!("{}: {} ({})", self.kind, self.message, loc),
            None => format!("{}: {}", self.kind, self.message),
        }
    }

    pub fn show_backtrace(&self) {
        let mut trace = self.trace.clone();
        trace.resolve();
        error!("{}\n{:?}", self.diagnostic(), trace);
    }
}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::new(ErrorKind::Io, &e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_format() {
        let err = SmallError::new(ErrorKind::Parse, "unexpected token");
        assert_eq!(err.diagnostic(), "ParseError: unexpected token");

        let err = err.with_location(2, 14);
        assert_eq!(
            err.diagnostic(),
            "ParseError: unexpected token (line 2, column 14)"
        );
    }
}
