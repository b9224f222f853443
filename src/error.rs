use std::fmt;
use std::io;
use std::time::Duration;

#[derive(Debug)]
pub enum BackupError {
    Config(String),
    Enumeration(String),
    ExistenceCheck(String),
    DumpStart(String),
    DumpRuntime(String),
    Compression(String),
    Upload(String),
    Cancelled(String),
    Timeout(Duration),
    Task(String),
    Io(io::Error),
    Incomplete { errors: usize },
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BackupError::Enumeration(msg) => write!(f, "Could not list databases: {}", msg),
            BackupError::ExistenceCheck(msg) => write!(f, "Existence check failed: {}", msg),
            BackupError::DumpStart(msg) => write!(f, "mysqldump error: {}", msg),
            BackupError::DumpRuntime(msg) => write!(f, "mysqldump error: {}", msg),
            BackupError::Compression(msg) => write!(f, "Compression error: {}", msg),
            BackupError::Upload(msg) => write!(f, "S3 error: {}", msg),
            BackupError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            BackupError::Timeout(after) => write!(f, "Job timed out after {}s", after.as_secs()),
            BackupError::Task(msg) => write!(f, "Task error: {}", msg),
            BackupError::Io(err) => write!(f, "IO error: {}", err),
            BackupError::Incomplete { errors } => write!(f, "{} errors occurred!", errors),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl BackupError {
    /// Teardown noise from a stage that was stopped because a sibling failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BackupError::Cancelled(_))
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl From<mysql_async::Error> for BackupError {
    fn from(err: mysql_async::Error) -> Self {
        BackupError::Enumeration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
