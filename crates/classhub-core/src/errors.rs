/// Failure to turn a raw frame into a protocol message.
///
/// Never fatal for the connection: the frame is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized message: missing or unreadable act")]
    MissingAct,

    #[error("unrecognized message: unknown act {0:?}")]
    UnknownAct(String),

    #[error("unrecognized message: malformed act {act} payload: {source}")]
    Malformed {
        act: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognized message: invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingAct => "missing_act",
            Self::UnknownAct(_) => "unknown_act",
            Self::Malformed { .. } => "malformed_payload",
            Self::InvalidJson(_) => "invalid_json",
        }
    }
}
