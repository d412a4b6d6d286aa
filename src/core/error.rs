use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    NotFound,
    InvalidArgument,
    InvalidState,
    Internal,
    /// Storage state contradicts itself (missing referenced entity, replay mismatch, ...)
    Consistency,
    ConstraintViolation,
    InvalidEntityLength,
    LockContention,
    /// Channel processing was disabled by an earlier channel failure
    Disrupted,
    ZombieOid,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn consistency(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Consistency, context.into())
    }

    pub fn constraint(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::ConstraintViolation, context.into())
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, context.into())
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, context.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Consistency | ErrorKind::InvalidEntityLength | ErrorKind::LockContention
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
