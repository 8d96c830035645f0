//! Error types shared by every subsystem of the acquisition backend.

use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The extension lacks the capability, or an absolute path is outside
    /// every registered download directory.
    #[error("file access denied: {0}")]
    PermissionDenied(String),

    /// A relative path resolved outside the extension's data directory.
    #[error("file access denied: path '{path}' is outside sandbox")]
    PathTraversal { path: String },

    #[error("network access denied: domain '{domain}' is not in the allowed list")]
    DomainNotAllowed { domain: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// `forced` is set when the script ignored the interrupt for the whole
    /// grace period and may still be running.
    #[error("execution timeout exceeded{}", forced_suffix(.forced))]
    Timeout { forced: bool },

    #[error("panic during execution: {0}")]
    PanicRecovered(String),

    /// An error thrown by the script itself.
    #[error("script error: {0}")]
    Script(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn forced_suffix(forced: &bool) -> &'static str {
    if *forced {
        " (force)"
    } else {
        ""
    }
}

impl Error {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable machine-readable code, surfaced to scripts next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::PathTraversal { .. } => "path_traversal",
            Self::DomainNotAllowed { .. } => "domain_not_allowed",
            Self::Network(_) => "network_error",
            Self::Decode(_) => "decode_error",
            Self::Timeout { .. } => "timeout",
            Self::PanicRecovered(_) => "panic_recovered",
            Self::Script(_) => "script_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Sandbox violations are always logged by the caller, never swallowed.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::PathTraversal { .. } | Self::DomainNotAllowed { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(crate::diagnostics::error_chain(&err))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
