use thiserror::Error;

/// Errors produced while parsing a behavior chain.
///
/// When the chain came from a request the handler surfaces these as 400;
/// when it came from `DEFAULT_BEHAVIOR` they are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BehaviorError {
    #[error("unknown behavior directive {0:?}")]
    UnknownDirective(String),

    #[error("directive {0:?} is missing '='")]
    MissingValue(String),

    #[error("invalid {key} value {value:?}: {reason}")]
    InvalidDirective {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl BehaviorError {
    pub fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        BehaviorError::InvalidDirective {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors produced while loading the service configuration from the
/// environment. Always fatal: the process refuses to start on a malformed
/// `UPSTREAMS` or port value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid upstream record {record:?}: {reason}")]
    InvalidUpstream { record: String, reason: String },

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
}
