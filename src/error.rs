//! Error types for suite-core
//!
//! Centralized error handling using snafu for ergonomic error definitions.

use snafu::Snafu;

/// Main error type for the crate
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Store unreachable (after backoff, or the operation failed at the transport level)
    #[snafu(display("Connection error: {message}"))]
    Connection { message: String },

    /// Caller-specified timeout elapsed before the operation completed
    #[snafu(display("Timeout: {message}"))]
    Timeout { message: String },

    /// Version mismatch on a compare-and-swap save
    #[snafu(display("Conflict on {key}: expected version {expected}, found {actual}"))]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// An active registry entry with the same service id already exists
    #[snafu(display("Service already registered: {service_id}"))]
    DuplicateService { service_id: String },

    /// Missing record, account, credential or service
    #[snafu(display("{kind} not found: {id}"))]
    NotFound { kind: &'static str, id: String },

    /// Stored data could not be decoded (or a record could not be encoded)
    #[snafu(display("Serialization error for {key}: {message}"))]
    Serialization { key: String, message: String },

    /// Master key unavailable, or encryption / decryption failure
    #[snafu(display("Encryption error: {message}"))]
    Encryption { message: String },

    /// Lifecycle transition not permitted by the service state machine
    #[snafu(display("Service {service_id}: invalid transition {from} -> {to}"))]
    InvalidTransition {
        service_id: String,
        from: String,
        to: String,
    },

    /// Invalid input or configuration
    #[snafu(display("Invalid: {message}"))]
    Invalid { message: String },

    /// IO error (config files, key files)
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// JSON serialization/deserialization error
    #[snafu(display("JSON error: {source}"))]
    Json { source: serde_json::Error },

    /// TOML deserialization error
    #[snafu(display("TOML parse error: {source}"))]
    TomlDe { source: toml::de::Error },
}

impl Error {
    /// Whether the ConnectionManager should retry the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::Invalid {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Serialization {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn encryption(message: impl Into<String>) -> Self {
        Error::Encryption {
            message: message.into(),
        }
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Json { source }
    }
}

impl From<toml::de::Error> for Error {
    fn from(source: toml::de::Error) -> Self {
        Error::TomlDe { source }
    }
}

impl From<fred::error::Error> for Error {
    fn from(source: fred::error::Error) -> Self {
        use fred::error::ErrorKind;

        if matches!(
            source.kind(),
            ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure
        ) {
            Error::Connection {
                message: source.to_string(),
            }
        } else {
            Error::Invalid {
                message: format!("store rejected command: {source}"),
            }
        }
    }
}

/// Result type alias for convenience
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_is_transient() {
        assert!(Error::connection("down").is_transient());
        assert!(!Error::not_found("Record", "x").is_transient());
        assert!(
            !Error::Conflict {
                key: "k".into(),
                expected: 1,
                actual: 2
            }
            .is_transient()
        );
    }

    #[test]
    fn test_display() {
        let err = Error::not_found("Account", "acc-1");
        assert_eq!(err.to_string(), "Account not found: acc-1");
    }
}
