//! Transparent MITM proxy: accepts redirected TCP connections, terminates
//! TLS with a dynamically-issued leaf certificate, applies header rewrites
//! and secrets substitution, observes MCP JSON-RPC traffic, enforces the
//! connect and MCP policies, and forwards to the real origin.

pub mod cert_resolver;
pub mod error;
pub mod forward;
pub mod mcp_observer;
pub mod original_dst;
pub mod secrets_apply;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::net::TcpListener;

use leash_ca::CertificateAuthority;
use leash_lsm::KernelBackend;
use leash_lsm::LSMManager;
use leash_logger::SharedLogger;
use leash_policy::ir::HeaderRewriteRule;
use leash_secrets::SecretsManager;

pub use error::ProxyError;
pub use forward::ProxyState;
pub use mcp_observer::DEFAULT_SNIFF_LIMIT;
pub use mcp_observer::DEFAULT_SSE_EVENT_LIMIT;
pub use secrets_apply::MAX_BODY_SUBSTITUTION_BYTES;

impl<B: KernelBackend> ProxyState<B> {
    pub fn new(ca: Arc<CertificateAuthority>, lsm: Arc<LSMManager<B>>, secrets: Arc<SecretsManager>, logger: SharedLogger) -> Self {
        Self {
            ca,
            lsm,
            secrets,
            logger,
            header_rewrites: Arc::new(RwLock::new(Vec::new())),
            upstream: upstream::build_client(),
            sniff_limit: DEFAULT_SNIFF_LIMIT,
        }
    }

    pub fn set_header_rewrites(&self, rewrites: Vec<HeaderRewriteRule>) {
        *self.header_rewrites.write().expect("header rewrite lock poisoned") = rewrites;
    }
}

/// Runs the accept loop on `listener`, spawning one task per connection.
/// Each connection's errors are logged and do not bring down the listener.
pub async fn run(listener: TcpListener, state: Arc<ProxyState<impl KernelBackend + 'static>>) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = forward::handle_connection(stream, peer_addr, state).await {
                tracing::warn!(%peer_addr, %error, "proxy connection failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use leash_lsm::NullBackend;

    #[tokio::test]
    async fn state_constructs_with_default_sniff_limit() {
        let tmp = tempfile::tempdir().expect("tmp dir");
        let private = tmp.path().join("private");
        let public = tmp.path().join("public");
        let ca = Arc::new(CertificateAuthority::load_or_create(&private, &public).expect("ca"));
        let lsm = Arc::new(LSMManager::new(Arc::new(NullBackend::new())));
        let secrets = Arc::new(SecretsManager::new());
        let logger = SharedLogger::new();

        let state = ProxyState::new(ca, lsm, secrets, logger);
        assert_eq!(state.sniff_limit, DEFAULT_SNIFF_LIMIT);
        state.set_header_rewrites(vec![HeaderRewriteRule {
            host: "example.com".to_string(),
            header: "x-leash".to_string(),
            value: "1".to_string(),
        }]);
        assert_eq!(state.header_rewrites.read().unwrap().len(), 1);
    }
}
