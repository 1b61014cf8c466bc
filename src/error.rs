//! Error types for the execution engine

use thiserror::Error;

/// The failure classes an invocation can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Coercion,
    Provisioning,
    Invocation,
    OutputTypeMismatch,
    StateStore,
    Descriptor,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Need to supply required arguments: `{}`", .0.join(", "))]
    MissingArguments(Vec<String>),

    #[error("Need to supply required environment variables: `{}`", .0.join(", "))]
    MissingEnvironmentVariables(Vec<String>),

    #[error("Argument `{0}` is not declared by this command")]
    UnknownArgument(String),

    #[error("`{name}` {rule}")]
    ConstraintViolation { name: String, rule: String },

    #[error("Argument `{0}` can only have a pattern, enum, or range defined")]
    ConflictingConstraints(String),

    #[error("Invalid pattern for `{name}`: {detail}")]
    InvalidPattern { name: String, detail: String },

    #[error("Cannot cast `{value}` for `{name}` to type `{ty}`")]
    Coercion {
        name: String,
        value: String,
        ty: String,
    },

    #[error("No open ports left after {attempts} attempts")]
    PortExhausted { attempts: usize },

    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    #[error("Container could not be started after {attempts} attempts: {last}")]
    StartAttemptsExhausted { attempts: u32, last: String },

    #[error("Timed out after {secs}s while {during}")]
    Timeout { during: String, secs: u64 },

    #[error("{0}")]
    Invocation(String),

    #[error("Request failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Connection kept resetting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Output `{output}` is not of type `{expected}`")]
    OutputTypeMismatch { expected: String, output: String },

    #[error("State file error: {0}")]
    StateStore(String),

    #[error("{0}")]
    Descriptor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::MissingArguments(_)
            | ExecError::MissingEnvironmentVariables(_)
            | ExecError::UnknownArgument(_)
            | ExecError::ConstraintViolation { .. }
            | ExecError::ConflictingConstraints(_)
            | ExecError::InvalidPattern { .. } => ErrorKind::Validation,
            ExecError::Coercion { .. } => ErrorKind::Coercion,
            ExecError::PortExhausted { .. }
            | ExecError::ContainerStart(_)
            | ExecError::StartAttemptsExhausted { .. } => ErrorKind::Provisioning,
            ExecError::Timeout { during, .. } if during.starts_with("starting") => {
                ErrorKind::Provisioning
            }
            ExecError::Timeout { .. }
            | ExecError::Invocation(_)
            | ExecError::HttpStatus { .. }
            | ExecError::RetriesExhausted { .. }
            | ExecError::Io(_) => ErrorKind::Invocation,
            ExecError::OutputTypeMismatch { .. } => ErrorKind::OutputTypeMismatch,
            ExecError::StateStore(_) => ErrorKind::StateStore,
            ExecError::Descriptor(_) => ErrorKind::Descriptor,
        }
    }
}

/// An engine-level failure: the underlying cause prefixed with what was being run.
#[derive(Debug, Error)]
#[error("Failed {subject}. {source}")]
pub struct Failure {
    pub subject: String,
    #[source]
    pub source: ExecError,
}

impl Failure {
    pub fn new(subject: impl Into<String>, source: ExecError) -> Self {
        Self {
            subject: subject.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
