use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("Domain not found.")]
    DomainNotFound(String),
    #[error("Domain not running.")]
    NotRunning(String),
    #[error("Wrong domain state: {actual} (expected {expected})")]
    WrongDomainState { expected: String, actual: String },
    #[error("{0}")]
    Backend(String),
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
    #[error("Domain '{vm}' is already {state} on node {node}")]
    RemoteConflict {
        vm: String,
        node: String,
        state: String,
    },
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Quit task is executed, but it should be handled before.")]
    UnhandledQuit,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Serde(String),
}

impl ShiftError {
    pub fn backend(msg: impl Into<String>) -> Self {
        ShiftError::Backend(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ShiftError::Timeout(msg.into())
    }
}

impl From<toml::de::Error> for ShiftError {
    fn from(err: toml::de::Error) -> Self {
        ShiftError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for ShiftError {
    fn from(err: serde_yaml::Error) -> Self {
        ShiftError::MalformedRequest(err.to_string())
    }
}

impl From<serde_json::Error> for ShiftError {
    fn from(err: serde_json::Error) -> Self {
        ShiftError::Serde(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_message() {
        let err = ShiftError::NotRunning("vm-a".to_string());
        assert_eq!(err.to_string(), "Domain not running.");
    }

    #[test]
    fn test_backend_message_is_verbatim() {
        let err = ShiftError::backend("unable to connect to server");
        assert_eq!(err.to_string(), "unable to connect to server");
    }
}
