use classhub_core::ClientId;
use classhub_store::StoreError;

/// Hub-side failures. None of them stop the Hub task.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("outbound queue full for client {client_id}")]
    QueueFull { client_id: ClientId },

    #[error("hub is not running")]
    Stopped,
}

/// Identity and unit-directory failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid token")]
    InvalidToken,

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("{0}")]
    Upstream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::UnitNotFound(_) => "unit_not_found",
            Self::Upstream(_) => "upstream",
            Self::Http(_) => "http",
            Self::Decode(_) => "decode",
        }
    }
}

/// Why a WebSocket connection was refused before a client existed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("unit_id is empty.")]
    MissingUnit,

    #[error("token is empty.")]
    MissingToken,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one inbound message that did not go through cleanly.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProcessError {
    /// Business-rule violation, reported to the sender only.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ProcessError {
    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_read_as_frame_text() {
        assert_eq!(ConnectError::MissingToken.to_string(), "token is empty.");
        assert_eq!(
            ConnectError::from(ServiceError::InvalidToken).to_string(),
            "invalid token"
        );
        assert_eq!(
            ConnectError::from(ServiceError::Upstream("unit closed".into())).to_string(),
            "unit closed"
        );
    }

    #[test]
    fn service_error_kinds() {
        assert_eq!(ServiceError::InvalidToken.error_kind(), "invalid_token");
        assert_eq!(ServiceError::UnitNotFound("u1".into()).error_kind(), "unit_not_found");
    }
}
