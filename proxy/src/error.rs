use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to recover original destination: {0}")]
    OriginalDst(#[source] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("certificate authority error: {0}")]
    Ca(#[from] leash_ca::CaError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("secrets error: {0}")]
    Secrets(#[from] leash_secrets::SecretsError),
}
