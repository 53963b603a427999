//! Error types for the webhook tunnel server.

/// Coarse classification of a [`TunnelError`], used to pick protocol replies
/// and HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    ResourceExhausted,
    UpstreamFailure,
    Conflict,
    Internal,
}

/// Custom error types for tunnel-related operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("invalid scheme: {0} - must be http or https")]
    InvalidScheme(String),

    #[error("invalid host")]
    InvalidHost,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid host or port: {address}:{port}")]
    BindRejected { address: String, port: u32 },

    #[error("no public key")]
    MissingPublicKey,

    #[error("webhook '{0}' not found")]
    WebhookNotFound(String),

    #[error("no webhook bound to session '{0}'")]
    SessionNotFound(String),

    #[error("no webhook matches this key, run setup first")]
    NoMatchingWebhook,

    #[error("no free internal port after {attempts} attempts")]
    PortsExhausted { attempts: usize },

    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to open forwarded channel: {0}")]
    ChannelOpen(String),

    #[error("session already active for webhook '{0}'")]
    SessionAlreadyActive(String),

    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidUrl(_)
            | TunnelError::InvalidScheme(_)
            | TunnelError::InvalidHost
            | TunnelError::InvalidPort(_)
            | TunnelError::BindRejected { .. }
            | TunnelError::MissingPublicKey => ErrorKind::InvalidInput,
            TunnelError::WebhookNotFound(_)
            | TunnelError::SessionNotFound(_)
            | TunnelError::NoMatchingWebhook => ErrorKind::NotFound,
            TunnelError::PortsExhausted { .. } | TunnelError::BindFailed { .. } => {
                ErrorKind::ResourceExhausted
            }
            TunnelError::Upstream(_) | TunnelError::ChannelOpen(_) => ErrorKind::UpstreamFailure,
            TunnelError::SessionAlreadyActive(_) => ErrorKind::Conflict,
            TunnelError::SshError(_) | TunnelError::IoError(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::InvalidScheme("ftp".to_string());
        assert_eq!(format!("{}", err), "invalid scheme: ftp - must be http or https");

        let err = TunnelError::SessionAlreadyActive("abc".to_string());
        assert_eq!(format!("{}", err), "session already active for webhook 'abc'");

        let err = TunnelError::PortsExhausted { attempts: 50 };
        assert_eq!(format!("{}", err), "no free internal port after 50 attempts");
    }

    #[test]
    fn test_tunnel_error_kind() {
        assert_eq!(TunnelError::InvalidHost.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            TunnelError::BindRejected { address: "0.0.0.0".into(), port: 80 }.kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(TunnelError::NoMatchingWebhook.kind(), ErrorKind::NotFound);
        assert_eq!(
            TunnelError::PortsExhausted { attempts: 1 }.kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(TunnelError::Upstream("refused".into()).kind(), ErrorKind::UpstreamFailure);
        assert_eq!(TunnelError::SessionAlreadyActive("x".into()).kind(), ErrorKind::Conflict);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(TunnelError::from(io).kind(), ErrorKind::Internal);
    }
}
