//! On-disk node identity: private key, signed leaf certificate, CA root,
//! and the hub endpoint learned during bootstrap.
//!
//! A node that can load `crt.crt` + `crt.key` + `ca.crt` + `hub.json`
//! from its data directory skips the bootstrap protocol entirely and
//! dials the secure port directly. A missing or corrupt file set is
//! indistinguishable from "never bootstrapped" and re-triggers the full
//! certificate-signing-request flow.

use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::NodeSdkError;

pub const CERT_FILE: &str = "crt.crt";
pub const KEY_FILE: &str = "crt.key";
pub const CA_FILE: &str = "ca.crt";
pub const HUB_FILE: &str = "hub.json";

/// The hub address learned from `server-info`, persisted so later runs
/// can reach the secure session without the insecure listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEndpoint {
    pub host: String,
    pub tls_port: u16,
}

impl HubEndpoint {
    /// Load the stored endpoint, `None` if missing or unreadable.
    pub fn load(dir: &Path) -> Option<HubEndpoint> {
        let text = std::fs::read_to_string(dir.join(HUB_FILE)).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn store(&self, dir: &Path) -> Result<(), NodeSdkError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| NodeSdkError::Identity(format!("encode {HUB_FILE}: {e}")))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| NodeSdkError::Identity(format!("create {}: {e}", dir.display())))?;
        std::fs::write(dir.join(HUB_FILE), text)
            .map_err(|e| NodeSdkError::Identity(format!("write {HUB_FILE}: {e}")))
    }

    /// Drop the stored endpoint. The next connect re-runs the insecure
    /// `server-info` exchange; used when the stored address stops working.
    pub fn forget(dir: &Path) {
        let _ = std::fs::remove_file(dir.join(HUB_FILE));
    }
}

/// A complete, loadable node identity.
#[derive(Clone)]
pub struct Identity {
    /// Node UUID, extracted from the leaf certificate's Common Name.
    pub uuid: Uuid,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

/// A freshly generated key + CSR, pending hub approval.
pub struct CsrBundle {
    /// The UUID embedded as the CSR's Common Name. Becomes the node's
    /// permanent identity once the hub signs the request.
    pub uuid: Uuid,
    pub csr_pem: String,
}

impl Identity {
    /// Load a previously stored identity from `dir`.
    ///
    /// Returns `Ok(None)` when any of the three files is missing or
    /// unparseable; the caller then runs the bootstrap protocol.
    pub fn load(dir: &Path) -> Result<Option<Identity>, NodeSdkError> {
        let cert_pem = match std::fs::read_to_string(dir.join(CERT_FILE)) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let key_pem = match std::fs::read_to_string(dir.join(KEY_FILE)) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let ca_pem = match std::fs::read_to_string(dir.join(CA_FILE)) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };

        let uuid = match common_name_uuid(&cert_pem) {
            Ok(uuid) => uuid,
            Err(e) => {
                tracing::warn!(error = %e, "stored certificate unusable, re-bootstrapping");
                return Ok(None);
            }
        };

        Ok(Some(Identity {
            uuid,
            cert_pem,
            key_pem,
            ca_pem,
        }))
    }

    /// Persist a hub-signed certificate and CA root next to the key that
    /// produced the CSR, completing the bootstrap.
    pub fn store(
        dir: &Path,
        cert_pem: &str,
        ca_pem: &str,
    ) -> Result<Identity, NodeSdkError> {
        let uuid = common_name_uuid(cert_pem)
            .map_err(|e| NodeSdkError::Identity(format!("signed certificate: {e}")))?;
        let key_pem = std::fs::read_to_string(dir.join(KEY_FILE))
            .map_err(|e| NodeSdkError::Identity(format!("read {KEY_FILE}: {e}")))?;

        std::fs::write(dir.join(CERT_FILE), cert_pem)
            .map_err(|e| NodeSdkError::Identity(format!("write {CERT_FILE}: {e}")))?;
        std::fs::write(dir.join(CA_FILE), ca_pem)
            .map_err(|e| NodeSdkError::Identity(format!("write {CA_FILE}: {e}")))?;

        Ok(Identity {
            uuid,
            cert_pem: cert_pem.to_string(),
            key_pem,
            ca_pem: ca_pem.to_string(),
        })
    }

    /// Build a rustls client config presenting the leaf certificate and
    /// trusting only the hub's CA root.
    pub fn client_tls_config(&self) -> Result<Arc<rustls::ClientConfig>, NodeSdkError> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_pem.as_bytes()) {
            let cert =
                cert.map_err(|e| NodeSdkError::Identity(format!("read {CA_FILE}: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| NodeSdkError::Identity(format!("trust {CA_FILE}: {e}")))?;
        }

        let certs = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NodeSdkError::Identity(format!("read {CERT_FILE}: {e}")))?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| NodeSdkError::Identity(format!("read {KEY_FILE}: {e}")))?
            .ok_or_else(|| NodeSdkError::Identity(format!("{KEY_FILE} holds no key")))?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| NodeSdkError::Identity(format!("client tls config: {e}")))?;
        Ok(Arc::new(config))
    }
}

/// Generate (or reuse) a private key and build a PKCS#10 CSR whose
/// Common Name is a freshly generated UUID. The key is persisted to
/// `crt.key` immediately so a crash between "CSR sent" and "certificate
/// received" never strands a signed certificate without its key.
pub fn new_signing_request(
    dir: &Path,
    node_type: &str,
) -> Result<CsrBundle, NodeSdkError> {
    let key = load_or_generate_key(dir)?;
    let uuid = Uuid::new_v4();

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, uuid.to_string());
    params
        .distinguished_name
        .push(DnType::OrganizationName, node_type.to_string());

    let csr = params
        .serialize_request(&key)
        .map_err(|e| NodeSdkError::Identity(format!("build csr: {e}")))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| NodeSdkError::Identity(format!("encode csr: {e}")))?;

    Ok(CsrBundle { uuid, csr_pem })
}

fn load_or_generate_key(dir: &Path) -> Result<KeyPair, NodeSdkError> {
    let path = dir.join(KEY_FILE);
    if let Ok(pem) = std::fs::read_to_string(&path) {
        if let Ok(key) = KeyPair::from_pem(&pem) {
            return Ok(key);
        }
        tracing::warn!(path = %path.display(), "stored key unreadable, regenerating");
    }

    let key = KeyPair::generate()
        .map_err(|e| NodeSdkError::Identity(format!("generate key: {e}")))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| NodeSdkError::Identity(format!("create {}: {e}", dir.display())))?;
    std::fs::write(&path, key.serialize_pem())
        .map_err(|e| NodeSdkError::Identity(format!("write {KEY_FILE}: {e}")))?;
    Ok(key)
}

/// Extract the Subject Common Name of a PEM certificate as a UUID.
fn common_name_uuid(cert_pem: &str) -> Result<Uuid, NodeSdkError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| NodeSdkError::Identity(format!("certificate pem: {e:?}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| NodeSdkError::Identity(format!("certificate der: {e}")))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| NodeSdkError::Identity("certificate has no common name".into()))?;
    Uuid::parse_str(cn)
        .map_err(|e| NodeSdkError::Identity(format!("common name is not a uuid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::prelude::FromDer;

    #[test]
    fn load_from_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Identity::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn csr_common_name_is_the_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let req = new_signing_request(dir.path(), "example").unwrap();
        assert!(dir.path().join(KEY_FILE).exists());

        let (_, pem) = x509_parser::pem::parse_x509_pem(req.csr_pem.as_bytes()).unwrap();
        let (_, csr) = X509CertificationRequest::from_der(&pem.contents).unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, req.uuid.to_string());
    }

    #[test]
    fn key_is_reused_across_requests() {
        let dir = tempfile::tempdir().unwrap();
        new_signing_request(dir.path(), "example").unwrap();
        let first = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
        new_signing_request(dir.path(), "example").unwrap();
        let second = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        new_signing_request(dir.path(), "example").unwrap();

        // Stand in for the hub: self-sign a certificate carrying a UUID CN.
        let uuid = Uuid::new_v4();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, uuid.to_string());
        let cert = params.self_signed(&key).unwrap();

        Identity::store(dir.path(), &cert.pem(), &cert.pem()).unwrap();
        let loaded = Identity::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.uuid, uuid);
    }

    #[test]
    fn hub_endpoint_round_trips_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HubEndpoint::load(dir.path()).is_none());

        let endpoint = HubEndpoint {
            host: "hearth.local".into(),
            tls_port: 6443,
        };
        endpoint.store(dir.path()).unwrap();
        assert_eq!(HubEndpoint::load(dir.path()), Some(endpoint));

        HubEndpoint::forget(dir.path());
        assert!(HubEndpoint::load(dir.path()).is_none());
    }

    #[test]
    fn garbage_certificate_reads_as_unbootstrapped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CERT_FILE), "not a cert").unwrap();
        std::fs::write(dir.path().join(KEY_FILE), "not a key").unwrap();
        std::fs::write(dir.path().join(CA_FILE), "not a ca").unwrap();
        assert!(Identity::load(dir.path()).unwrap().is_none());
    }
}
