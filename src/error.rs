//! Error types for the accelerator compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every user-facing kind carries `stmt`, a one-line reconstruction of the
/// statement that failed, and `message`, the rule it violated. `Internal`
/// is reserved for invariants earlier passes should have established.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Scope error in `{stmt}`: {message}")]
    ScopeError { stmt: String, message: String },

    #[error("Type mismatch in `{stmt}`: {message}")]
    TypeMismatch { stmt: String, message: String },

    #[error("Dimension error in `{stmt}`: {message}")]
    DimensionError { stmt: String, message: String },

    #[error("Non-static bank in `{stmt}`: {message}")]
    NonStaticBank { stmt: String, message: String },

    #[error("Cannot lower `{stmt}`: {message}")]
    RewriteCapability { stmt: String, message: String },

    #[error("internal compiler error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn scope(stmt: impl ToString, msg: impl Into<String>) -> Self {
        CompileError::ScopeError {
            stmt: stmt.to_string(),
            message: msg.into(),
        }
    }

    pub fn mismatch(stmt: impl ToString, msg: impl Into<String>) -> Self {
        CompileError::TypeMismatch {
            stmt: stmt.to_string(),
            message: msg.into(),
        }
    }

    pub fn dimension(stmt: impl ToString, msg: impl Into<String>) -> Self {
        CompileError::DimensionError {
            stmt: stmt.to_string(),
            message: msg.into(),
        }
    }

    pub fn non_static_bank(stmt: impl ToString, msg: impl Into<String>) -> Self {
        CompileError::NonStaticBank {
            stmt: stmt.to_string(),
            message: msg.into(),
        }
    }

    pub fn capability(stmt: impl ToString, msg: impl Into<String>) -> Self {
        CompileError::RewriteCapability {
            stmt: stmt.to_string(),
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::Config { message: msg.into() }
    }

    /// True when the error signals a compiler defect rather than a mistake
    /// in the input program.
    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal { .. })
    }

    /// The offending statement, for the user-facing kinds that name one.
    pub fn statement(&self) -> Option<&str> {
        match self {
            CompileError::ScopeError { stmt, .. }
            | CompileError::TypeMismatch { stmt, .. }
            | CompileError::DimensionError { stmt, .. }
            | CompileError::NonStaticBank { stmt, .. }
            | CompileError::RewriteCapability { stmt, .. } => Some(stmt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_is_distinguishable() {
        assert!(CompileError::internal("bad arity").is_internal());
        assert!(!CompileError::mismatch("x := true;", "bool vs ubit<32>").is_internal());
    }

    #[test]
    fn test_statement_is_reported() {
        let err = CompileError::capability("a[i] := 1;", "dynamic bank in write");
        assert_eq!(err.statement(), Some("a[i] := 1;"));
        assert_eq!(
            err.to_string(),
            "Cannot lower `a[i] := 1;`: dynamic bank in write"
        );
    }
}
