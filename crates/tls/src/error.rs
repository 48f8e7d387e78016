//! Error types for gatehouse-tls

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid hostname")]
    InvalidHostname,

    #[error("Certificate name must not be empty")]
    MissingCertificateName,

    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),
}

pub type Result<T> = std::result::Result<T, TlsError>;
