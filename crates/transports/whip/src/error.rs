//! Error types for WHIP signaling

/// Result type alias using WHIP Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signaling a WHIP session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection failure, timeout or HTTP client construction failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-201 answer to POST, non-200/204 answer to OPTIONS
    #[error("Unexpected HTTP status: {0}")]
    UnexpectedStatus(u16),

    /// Link header yielded no usable ICE server
    #[error("Malformed Link header: {0}")]
    MalformedLinkHeader(String),

    /// Peer connection refused a TURN/TURNS server
    #[error("ICE server rejected: {0}")]
    IceServerRejected(String),

    /// SDP text could not be parsed
    #[error("SDP parse error: {0}")]
    SdpParse(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A URL could not be parsed or resolved
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Peer connection capability failure
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// POST would overwrite the resource URL of a live session
    #[error("Session already has a resource: {0}")]
    ResourceExists(String),

    /// Session was torn down, or a response arrived for a torn down session
    #[error("Session torn down")]
    TornDown,

    /// In-flight HTTP exchange was aborted
    #[error("HTTP exchange cancelled")]
    Cancelled,

    /// A negotiation cycle is already running
    #[error("Negotiation already in progress")]
    InProgress,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transport(format!("request timed out: {}", err))
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

impl Error {
    /// Check if a later negotiation-needed trigger may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::UnexpectedStatus(_) | Error::InProgress
        )
    }

    /// Check if this error aborts the negotiation cycle it happened in
    ///
    /// ICE server problems never abort a cycle.
    pub fn is_fatal_to_cycle(&self) -> bool {
        !matches!(
            self,
            Error::MalformedLinkHeader(_) | Error::IceServerRejected(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::InvalidUrl(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::UnexpectedStatus(404).to_string(),
            "Unexpected HTTP status: 404"
        );
        assert_eq!(Error::TornDown.to_string(), "Session torn down");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Transport("reset".to_string()).is_retryable());
        assert!(Error::UnexpectedStatus(503).is_retryable());
        assert!(!Error::SdpParse("empty".to_string()).is_retryable());
        assert!(!Error::TornDown.is_retryable());
    }

    #[test]
    fn test_ice_errors_are_not_fatal() {
        assert!(!Error::IceServerRejected("turn://x".to_string()).is_fatal_to_cycle());
        assert!(!Error::MalformedLinkHeader("".to_string()).is_fatal_to_cycle());
        assert!(Error::UnexpectedStatus(500).is_fatal_to_cycle());
        assert!(Error::SdpParse("bad".to_string()).is_fatal_to_cycle());
    }

    #[test]
    fn test_url_error_conversion() {
        let err = Error::from(url::Url::parse("not a url").unwrap_err());
        assert!(err.is_config_error());
    }
}
