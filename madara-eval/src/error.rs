use thiserror::Error;

/// A structured compile- or runtime-time failure in KaRL source, naming
/// what went wrong and where (spec §4.2: "compile errors throw a
/// structured error value naming kind and cursor location").
#[derive(Debug, Error)]
pub enum KarlError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },

    #[error("unexpected token '{found}' at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("unknown system call '#{name}'")]
    UnknownSystemCall { name: String },

    #[error("system call '#{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("invalid assignment target: left-hand side must be a variable or array element")]
    InvalidLvalue,

    #[error("division by a constant zero")]
    ConstantDivideByZero,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KarlError>;
