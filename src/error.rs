use crate::codec::RelayMessage;
use snafu::{Backtrace, Snafu};
use tracing::{error, warn};

/// Relay errors. The display form of every variant except the internal ones
/// is the exact reason string sent to the client, prefix included.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{message}"))]
    Notice {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid: {message}"))]
    Invalid {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("blocked: {message}"))]
    Blocked {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("auth-required: {message}"))]
    AuthRequired {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("rate-limited: {message}"))]
    RateLimited {
        message: String,
        retry_after_ms: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("duplicate: {message}"))]
    Duplicate {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported: {message}"))]
    Unsupported {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Storage error: {message}"))]
    Storage {
        message: String,
        transient: bool,
        backtrace: Backtrace,
    },

    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn notice<S: Into<String>>(message: S) -> Self {
        Error::Notice {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Error::Invalid {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn blocked<S: Into<String>>(message: S) -> Self {
        Error::Blocked {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn auth_required<S: Into<String>>(message: S) -> Self {
        Error::AuthRequired {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn rate_limited<S: Into<String>>(message: S, retry_after_ms: u64) -> Self {
        Error::RateLimited {
            message: message.into(),
            retry_after_ms,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn duplicate<S: Into<String>>(message: S) -> Self {
        Error::Duplicate {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Error::Unsupported {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn storage<S: Into<String>>(message: S, transient: bool) -> Self {
        Error::Storage {
            message: message.into(),
            transient,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage { transient: true, .. })
    }

    /// Reason string for OK and CLOSED replies. Internal failures are never
    /// leaked to clients.
    pub fn client_reason(&self) -> String {
        match self {
            Error::Storage { message, .. } => {
                error!(target: "storage", "Storage failure: {}", message);
                "error: storage unavailable".to_string()
            }
            Error::Internal { message, .. } => {
                error!("Internal error: {}", message);
                "error: internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Replies for a rejected EVENT. Rate limiting is announced with a NOTICE
    /// carrying the retry hint before the negative OK.
    pub fn to_relay_messages_from_event(&self, event_id: &str) -> Vec<RelayMessage> {
        match self {
            Error::Notice { message, .. } => vec![RelayMessage::notice(message.clone())],
            Error::RateLimited {
                message,
                retry_after_ms,
                ..
            } => {
                warn!("Rate limited: {}", message);
                vec![
                    RelayMessage::notice(format!(
                        "rate-limited: {message}, retry after {retry_after_ms}ms"
                    )),
                    RelayMessage::ok(event_id, false, self.client_reason()),
                ]
            }
            _ => vec![RelayMessage::ok(event_id, false, self.client_reason())],
        }
    }

    pub fn to_relay_messages_from_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Vec<RelayMessage> {
        match self {
            Error::Notice { message, .. } => vec![RelayMessage::notice(message.clone())],
            _ => {
                warn!("Closing subscription {}: {}", subscription_id, self);
                vec![RelayMessage::closed(subscription_id, self.client_reason())]
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        let transient = matches!(
            error.sqlite_error_code(),
            Some(
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            )
        );
        Error::storage(format!("Database error: {error}"), transient)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::internal(format!("JSON error: {error}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::internal(format!("Blocking task failed: {error}"))
    }
}
