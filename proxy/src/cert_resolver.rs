//! Bridges [`leash_ca::CertificateAuthority`] into rustls's dynamic
//! certificate resolution, issuing a leaf certificate per SNI hostname
//! seen during the TLS handshake.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::ClientHello;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;

use leash_ca::CertificateAuthority;

pub struct HostCertResolver {
    ca: Arc<CertificateAuthority>,
    /// Used when the client skips SNI (e.g. connecting directly by IP).
    fallback_host: String,
}

impl HostCertResolver {
    pub fn new(ca: Arc<CertificateAuthority>, fallback_host: String) -> Self {
        Self { ca, fallback_host }
    }
}

impl std::fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name().map(ToString::to_string).unwrap_or_else(|| self.fallback_host.clone());
        let leaf = match self.ca.leaf_for_host(&host) {
            Ok(leaf) => leaf,
            Err(error) => {
                tracing::warn!(%host, %error, "failed to issue leaf certificate");
                return None;
            }
        };
        certified_key_from_pem(&leaf.cert_pem, &leaf.key_pem)
    }
}

fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Option<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
        .collect::<Result<_, _>>()
        .ok()?;
    let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem)).ok()??;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).ok()?;
    Some(Arc::new(CertifiedKey::new(certs, signing_key)))
}
