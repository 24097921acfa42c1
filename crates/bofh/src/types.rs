//! Error types shared by the bofhd client.

/// How a server-reported fault should be interpreted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The server restarted; the command table is stale and the session gone.
    ServerRestarted,
    /// The session token expired or authentication failed.
    SessionExpired,
    /// An ordinary application error (`CerebrumError`).
    Cerebrum,
    Other,
}

impl FaultKind {
    /// Classify a fault by the exception name bofhd embeds in the message.
    pub fn classify(message: &str) -> Self {
        if message.contains("ServerRestartedError") {
            FaultKind::ServerRestarted
        } else if message.contains("SessionExpiredError")
            || message.contains("Authentication failure")
        {
            FaultKind::SessionExpired
        } else if message.contains("CerebrumError") {
            FaultKind::Cerebrum
        } else {
            FaultKind::Other
        }
    }
}

/// Errors that can occur while talking to bofhd.
#[derive(thiserror::Error, Debug)]
pub enum BofhError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Not authenticated: log in before calling {0}")]
    NotAuthenticated(String),

    #[error("Remote fault {code}: {message}")]
    RemoteFault { code: i32, message: String },

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Ambiguous command '{input}', candidates: {}", candidates.join(", "))]
    AmbiguousCommand {
        input: String,
        candidates: Vec<String>,
    },

    #[error("Format error: {0}")]
    Format(String),
}

impl BofhError {
    /// Whether the failure happened below the application layer, so a new
    /// attempt might behave differently.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BofhError::ConnectionError(_) | BofhError::TransportFault(_)
        )
    }

    /// Fault classification, if this is a server-reported fault.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            BofhError::RemoteFault { message, .. } => Some(FaultKind::classify(message)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BofhError {
    fn from(e: std::io::Error) -> Self {
        BofhError::TransportFault(e.to_string())
    }
}

/// Convenience result type.
pub type BofhResult<T> = Result<T, BofhError>;
