//! Embedder-facing errors.
//!
//! Failures inside bytecode execution never surface here directly: they are
//! turned into Java exceptions and only reach the embedder when nothing on
//! the Java stack catches them (see [`VmError::UncaughtException`]).

use thiserror::Error;

/// A Java exception that escaped a call-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrownException {
    pub class_name: String,
    pub message: Option<String>,
    /// Innermost frame first, formatted as `Class.method(pc)`.
    pub stack_trace: Vec<String>,
}

impl std::fmt::Display for ThrownException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.class_name.replace('/', "."), msg)?,
            None => write!(f, "{}", self.class_name.replace('/', "."))?,
        }
        for frame in &self.stack_trace {
            write!(f, "\n\tat {}", frame)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid program image: {0}")]
    Image(String),

    #[error("class format error in {class}: {message}")]
    ClassFormat { class: String, message: String },

    #[error("assembler error at line {line}: {message}")]
    Assemble { line: usize, message: String },

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("method not found: {class}.{name}{descriptor}")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("argument mismatch calling {method}: {message}")]
    ArgumentMismatch { method: String, message: String },

    #[error("uncaught exception {0}")]
    UncaughtException(ThrownException),

    #[error("thread panicked: {0}")]
    ThreadPanicked(String),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// The escaped Java exception, if this error carries one.
    pub fn exception(&self) -> Option<&ThrownException> {
        match self {
            VmError::UncaughtException(e) => Some(e),
            _ => None,
        }
    }
}
