//! TLS configuration and request authorization.
//!
//! Secure mode authenticates clients by certificate: the certificate's
//! common name must be allowed to submit requests on behalf of the
//! declared user. The `node` and `root` identities may act for anyone;
//! other identities only for themselves. Insecure mode trusts the
//! declared user outright and exists for development and tests.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Identity allowed to act on behalf of any user.
pub const NODE_USER: &str = "node";

/// The administrative user.
pub const ROOT_USER: &str = "root";

/// File names under the certificates directory.
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const NODE_CERT_DER_FILE: &str = "node.der";
pub const NODE_KEY_DER_FILE: &str = "node.key.der";

/// Security settings for one node.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Run without TLS or client authentication.
    pub insecure: bool,

    /// Directory holding the CA, node, and client certificates.
    pub certs_dir: PathBuf,
}

impl SecurityConfig {
    pub fn insecure() -> Self {
        Self {
            insecure: true,
            certs_dir: PathBuf::new(),
        }
    }

    pub fn secure(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            insecure: false,
            certs_dir: certs_dir.into(),
        }
    }

    /// Build a TLS acceptor from the node certificate, for the wire
    /// listener in secure mode.
    pub fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        let cert = load_der(self.certs_dir.join(NODE_CERT_DER_FILE))?;
        let key = load_der(self.certs_dir.join(NODE_KEY_DER_FILE))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert)],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
            )
            .context("building TLS server config")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_der(path: PathBuf) -> Result<Vec<u8>> {
    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
}

/// Decide whether `common_name` may submit requests as `user`.
///
/// The node and root identities act for anyone; every other certificate
/// only for the user matching its common name.
pub fn common_name_allows(common_name: &str, user: &str) -> bool {
    if user.is_empty() {
        return false;
    }
    common_name == NODE_USER || common_name == ROOT_USER || common_name == user
}

/// Resolve the authenticated user for a request.
///
/// `peer_common_name` is the client certificate's common name when a TLS
/// handshake produced one. Returns the effective user, or `None` when
/// the request must be rejected with 401.
pub fn authenticate(
    config: &SecurityConfig,
    peer_common_name: Option<&str>,
    declared_user: &str,
) -> Option<String> {
    let user = if declared_user.is_empty() {
        ROOT_USER
    } else {
        declared_user
    };
    if config.insecure {
        return Some(user.to_string());
    }
    match peer_common_name {
        Some(cn) if common_name_allows(cn, user) => Some(user.to_string()),
        _ => None,
    }
}

/// Generate a certificate authority plus a node certificate under
/// `certs_dir`. Used by `cert create-ca` / `create-node`.
pub fn create_ca(certs_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(certs_dir)
        .with_context(|| format!("creating {}", certs_dir.display()))?;
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "meridian-ca");
    let key = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    std::fs::write(certs_dir.join(CA_CERT_FILE), cert.pem())?;
    std::fs::write(certs_dir.join(CA_KEY_FILE), key.serialize_pem())?;
    Ok(())
}

/// Generate a certificate with the given common name and hosts, writing
/// `<name>.crt` (PEM) plus `<name>.der` / `<name>.key.der` for the
/// listener. Used by `cert create-node` and `cert create-client`.
pub fn create_cert(certs_dir: &Path, name: &str, common_name: &str, hosts: &[String]) -> Result<()> {
    std::fs::create_dir_all(certs_dir)
        .with_context(|| format!("creating {}", certs_dir.display()))?;
    let mut params = rcgen::CertificateParams::new(hosts.to_vec())?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let key = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    std::fs::write(certs_dir.join(format!("{name}.crt")), cert.pem())?;
    std::fs::write(certs_dir.join(format!("{name}.der")), cert.der())?;
    std::fs::write(
        certs_dir.join(format!("{name}.key.der")),
        key.serialize_der(),
    )?;
    Ok(())
}
