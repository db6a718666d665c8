//! Certificate authority used by the MITM proxy to issue per-host leaf
//! certificates on the fly.
//!
//! The root key and certificate live in a split private/public directory
//! layout: the private directory holds `ca-key.pem` (mode 0600) and is
//! never served to clients; the public directory holds `ca-cert.pem`
//! (mode 0644) so operators can install it as a trusted root. Both halves
//! are created together or not at all — a directory holding exactly one of
//! the two files is a hard error, since it means a previous write was
//! interrupted partway.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::bn::MsbOption;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use openssl::x509::X509;
use openssl::x509::X509Name;
use openssl::x509::X509NameBuilder;
use openssl::x509::extension::AuthorityKeyIdentifier;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::extension::ExtendedKeyUsage;
use openssl::x509::extension::KeyUsage;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::extension::SubjectKeyIdentifier;
use thiserror::Error;

const ROOT_CERT_FILE: &str = "ca-cert.pem";
const ROOT_KEY_FILE: &str = "ca-key.pem";
const ROOT_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 397;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("openssl error: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error(
        "CA directory is in a partial state: {0} exists without its counterpart; refusing to overwrite"
    )]
    PartialState(&'static str),
    #[error("host `{0}` is not a valid certificate subject")]
    InvalidHost(String),
}

fn io_err(path: &Path, source: io::Error) -> CaError {
    CaError::Io { path: path.to_path_buf(), source }
}

/// A leaf certificate and its private key, both PEM-encoded, ready to hand
/// to a TLS stack's certificate resolver.
#[derive(Debug)]
pub struct LeafCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub struct CertificateAuthority {
    root_cert: X509,
    root_key: PKey<Private>,
    leaf_cache: RwLock<HashMap<String, Arc<LeafCertificate>>>,
}

impl CertificateAuthority {
    /// Loads the root CA from `private_dir`/`public_dir` if both halves
    /// exist, generates and persists a fresh one if neither exists, and
    /// errors if exactly one half is present.
    pub fn load_or_create(private_dir: &Path, public_dir: &Path) -> Result<Self, CaError> {
        let key_path = private_dir.join(ROOT_KEY_FILE);
        let cert_path = public_dir.join(ROOT_CERT_FILE);

        let key_exists = key_path.exists();
        let cert_exists = cert_path.exists();

        let (root_cert, root_key) = match (key_exists, cert_exists) {
            (true, true) => load_root(&key_path, &cert_path)?,
            (false, false) => {
                let (cert, key) = generate_root()?;
                fs::create_dir_all(private_dir).map_err(|e| io_err(private_dir, e))?;
                fs::create_dir_all(public_dir).map_err(|e| io_err(public_dir, e))?;
                write_atomic_create_new(&key_path, &key.rsa()?.private_key_to_pem()?, 0o600)?;
                write_atomic_create_new(&cert_path, &cert.to_pem()?, 0o644)?;
                tracing::info!(key = %key_path.display(), cert = %cert_path.display(), "generated new leash root CA");
                (cert, key)
            }
            (true, false) => return Err(CaError::PartialState("ca-key.pem")),
            (false, true) => return Err(CaError::PartialState("ca-cert.pem")),
        };

        Ok(Self {
            root_cert,
            root_key,
            leaf_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn root_cert_pem(&self) -> Result<Vec<u8>, CaError> {
        Ok(self.root_cert.to_pem()?)
    }

    /// Returns a cached leaf certificate for `host`, issuing and caching a
    /// fresh one on a cache miss. Uses a double-checked read/write lock
    /// upgrade so concurrent requests for the same never-before-seen host
    /// don't race to issue duplicate certificates.
    pub fn leaf_for_host(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        if let Some(found) = self.leaf_cache.read().expect("leaf cache lock poisoned").get(host) {
            return Ok(found.clone());
        }

        let mut cache = self.leaf_cache.write().expect("leaf cache lock poisoned");
        if let Some(found) = cache.get(host) {
            return Ok(found.clone());
        }

        let leaf = Arc::new(self.issue_leaf(host)?);
        cache.insert(host.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn issue_leaf(&self, host: &str) -> Result<LeafCertificate, CaError> {
        if host.is_empty() {
            return Err(CaError::InvalidHost(host.to_string()));
        }

        let rsa = Rsa::generate(2048)?;
        let key = PKey::from_rsa(rsa)?;

        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_text("CN", host)?;
        let subject = name_builder.build();

        let mut builder = openssl::x509::X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.root_cert.subject_name())?;
        builder.set_pubkey(&key)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_serial_number(&random_serial()?)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(KeyUsage::new().digital_signature().key_encipherment().critical().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let mut san = SubjectAlternativeName::new();
        if is_ip_literal(host) {
            san.ip(host);
        } else {
            san.dns(host);
            if !host.starts_with("*.") && host.contains('.') {
                san.dns(&format!("*.{host}"));
            }
        }
        let san_ext = {
            let ctx = builder.x509v3_context(Some(&self.root_cert), None);
            san.build(&ctx)?
        };
        builder.append_extension(san_ext)?;

        let ski = {
            let ctx = builder.x509v3_context(Some(&self.root_cert), None);
            SubjectKeyIdentifier::new().build(&ctx)?
        };
        builder.append_extension(ski)?;

        let aki = {
            let ctx = builder.x509v3_context(Some(&self.root_cert), None);
            AuthorityKeyIdentifier::new().keyid(true).build(&ctx)?
        };
        builder.append_extension(aki)?;

        builder.sign(&self.root_key, MessageDigest::sha256())?;
        let cert = builder.build();

        Ok(LeafCertificate {
            cert_pem: cert.to_pem()?,
            key_pem: key.private_key_to_pem_pkcs8()?,
        })
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_ok()
}

fn random_serial() -> Result<openssl::bn::BigNum, CaError> {
    let mut bn = BigNum::new()?;
    bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
    Ok(bn)
}

fn load_root(key_path: &Path, cert_path: &Path) -> Result<(X509, PKey<Private>), CaError> {
    let key_bytes = fs::read(key_path).map_err(|e| io_err(key_path, e))?;
    let cert_bytes = fs::read(cert_path).map_err(|e| io_err(cert_path, e))?;
    let key = PKey::private_key_from_pem(&key_bytes)?;
    let cert = X509::from_pem(&cert_bytes)?;
    Ok((cert, key))
}

fn generate_root() -> Result<(X509, PKey<Private>), CaError> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let subject = root_subject_name()?;

    let mut builder = openssl::x509::X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(&subject)?;
    builder.set_pubkey(&key)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(ROOT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_serial_number(&random_serial()?)?;

    builder.append_extension(BasicConstraints::new().ca().pathlen(0).critical().build()?)?;
    builder.append_extension(KeyUsage::new().key_cert_sign().digital_signature().critical().build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;

    let ski = {
        let ctx = builder.x509v3_context(None, None);
        SubjectKeyIdentifier::new().build(&ctx)?
    };
    builder.append_extension(ski)?;

    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok((cert, key))
}

fn root_subject_name() -> Result<X509Name, CaError> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_text("O", "Leash")?;
    builder.append_entry_by_text("CN", "Leash Root CA")?;
    Ok(builder.build())
}

/// Writes `data` to `path` durably: write to a sibling temp file, fsync it,
/// link it into place with create-new semantics (falling back to rename
/// when hard links aren't supported by the filesystem), then fsync the
/// containing directory so the rename itself survives a crash.
fn write_atomic_create_new(path: &Path, data: &[u8], mode: u32) -> Result<(), CaError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("ca")));

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp_path)
            .map_err(|e| io_err(&tmp_path, e))?;
        use std::io::Write;
        file.write_all(data).map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }

    match fs::hard_link(&tmp_path, path) {
        Ok(()) => {
            let _ = fs::remove_file(&tmp_path);
        }
        Err(_) => {
            fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
        }
    }

    if let Ok(dir_file) = fs::File::open(dir) {
        let _ = dir_file.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn generates_root_on_first_use_with_correct_modes() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        assert!(!ca.root_cert_pem().unwrap().is_empty());

        let key_meta = fs::metadata(private.path().join(ROOT_KEY_FILE)).unwrap();
        assert_eq!(key_meta.permissions().mode() & 0o777, 0o600);
        let cert_meta = fs::metadata(public.path().join(ROOT_CERT_FILE)).unwrap();
        assert_eq!(cert_meta.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn reloads_the_same_root_on_second_call() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let first = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        let second = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        assert_eq!(first.root_cert_pem().unwrap(), second.root_cert_pem().unwrap());
    }

    #[test]
    fn partial_state_is_a_hard_error() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        fs::write(private.path().join(ROOT_KEY_FILE), b"not a real key").unwrap();
        let err = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap_err();
        assert!(matches!(err, CaError::PartialState(_)));
    }

    #[test]
    fn issues_and_caches_leaf_certificates() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();

        let leaf_a = ca.leaf_for_host("example.com").unwrap();
        let leaf_b = ca.leaf_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&leaf_a, &leaf_b));

        let leaf_c = ca.leaf_for_host("other.example.com").unwrap();
        assert_ne!(leaf_a.cert_pem, leaf_c.cert_pem);
    }

    #[test]
    fn leaf_for_plain_host_also_gets_wildcard_san() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        let leaf = ca.leaf_for_host("example.com").unwrap();
        let cert = X509::from_pem(&leaf.cert_pem).unwrap();
        let san = cert.subject_alt_names().unwrap();
        let dns_names: Vec<&str> = san.iter().filter_map(|n| n.dnsname()).collect();
        assert!(dns_names.contains(&"example.com"));
        assert!(dns_names.contains(&"*.example.com"));
    }

    #[test]
    fn leaf_for_existing_wildcard_host_does_not_double_wildcard() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        let leaf = ca.leaf_for_host("*.example.com").unwrap();
        let cert = X509::from_pem(&leaf.cert_pem).unwrap();
        let san = cert.subject_alt_names().unwrap();
        let dns_names: Vec<&str> = san.iter().filter_map(|n| n.dnsname()).collect();
        assert_eq!(dns_names, vec!["*.example.com"]);
    }

    #[test]
    fn issues_ip_leaf_with_ip_san() {
        let private = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(private.path(), public.path()).unwrap();
        let leaf = ca.leaf_for_host("93.184.216.34").unwrap();
        assert!(!leaf.cert_pem.is_empty());
    }
}
