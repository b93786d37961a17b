use std::path::PathBuf;

use {bytes::Bytes, reqwest::StatusCode, thiserror::Error};

/// Failures of the underlying HTTP exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("server responded with {status}")]
    Status {
        status: StatusCode,
        /// Response body, when the server sent one.
        body: Option<Bytes>,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("cancelled before the authentication challenge was resolved")]
    Cancelled,
}

/// Why a connectivity probe failed. Exactly one is reported per probe.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("the server requires a client certificate")]
    ClientCertificateRequired,

    #[error("the server certificate is not trusted: {}", .0.join("; "))]
    SslUntrusted(Vec<String>),

    #[error("HTTP basic authentication is not supported")]
    BasicAuth,

    #[error("authentication method {0} is not supported")]
    AuthenticationUnsupported(String),

    #[error(transparent)]
    Other(#[from] TransportError),
}

impl AuthError {
    /// Every message worth showing to the user, top-level first.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::SslUntrusted(errors) if !errors.is_empty() => errors.clone(),
            Self::Other(TransportError::Status {
                status,
                body: Some(body),
            }) => vec![
                format!("server responded with {status}"),
                String::from_utf8_lossy(body).into_owned(),
            ],
            other => vec![other.to_string()],
        }
    }

    /// Trust failures can be retried by running the interactive flow again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SslUntrusted(_) | Self::ClientCertificateRequired)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self, Self::Other(TransportError::Cancelled))
    }
}

/// Failures importing a PKCS#12 client identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("the certificate file is protected by a passphrase")]
    WrongPassphrase,

    #[error("invalid PKCS#12 data: {0}")]
    Invalid(String),

    #[error("the certificate file contains no private key")]
    MissingKey,

    #[error("the certificate file contains no certificate")]
    MissingCertificate,

    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),
}
