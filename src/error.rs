use std::fmt;

use crate::grammars::SelectorError;

pub(crate) type ScopelineResult<T> = Result<T, Error>;

/// Errors that can occur while building a grammar.
///
/// Tokenizing a line never fails: problems found at that point are logged and
/// worked around so every line produces a result.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Reading a grammar or theme file failed.
    Io(std::io::Error),

    /// JSON parsing failed when reading a raw grammar or a raw theme.
    Json(serde_json::Error),

    /// The raw grammar has an empty `scopeName`.
    MissingScopeName,

    /// An `include` could not be resolved, either because the repository entry
    /// does not exist or because the external grammar is unknown.
    #[allow(missing_docs)]
    UnresolvedInclude { include: String, grammar: String },

    /// A capture key is a group number larger than what oniguruma supports.
    #[allow(missing_docs)]
    InvalidCapture { capture: String, grammar: String },

    /// A grammar was requested from a registry that does not know it.
    GrammarNotFound(String),

    /// A scope selector could not be parsed.
    InvalidSelector(SelectorError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "JSON parsing error: {}", err),
            Error::MissingScopeName => write!(f, "grammar has no scope name"),
            Error::UnresolvedInclude { include, grammar } => {
                write!(f, "unresolved include '{}' in grammar '{}'", include, grammar)
            }
            Error::InvalidCapture { capture, grammar } => {
                write!(f, "capture group '{}' out of range in grammar '{}'", capture, grammar)
            }
            Error::GrammarNotFound(name) => write!(f, "grammar '{}' not found", name),
            Error::InvalidSelector(err) => write!(f, "invalid selector: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::InvalidSelector(err) => Some(err),
            Error::MissingScopeName
            | Error::UnresolvedInclude { .. }
            | Error::InvalidCapture { .. }
            | Error::GrammarNotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<SelectorError> for Error {
    fn from(err: SelectorError) -> Self {
        Error::InvalidSelector(err)
    }
}
