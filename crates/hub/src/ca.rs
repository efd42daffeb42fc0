//! Self-issued certificate authority.
//!
//! The hub owns a root keypair persisted as `ca.crt`/`ca.key` in the data
//! directory. It signs node CSRs (binding the node UUID in the CSR's
//! Common Name into a client-auth leaf) and issues the TLS listener's own
//! server certificate at startup. Failure to create or persist the root
//! is the one startup error that terminates the hub.

use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams,
    CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::server::WebPkiClientVerifier;
use uuid::Uuid;

use hearth_domain::Error;

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";

/// Ten years, the validity of both the root and every issued leaf.
fn validity() -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    // Back-dated an hour so freshly issued certs work across clock skew.
    (now - time::Duration::hours(1), now + time::Duration::days(3650))
}

/// A leaf certificate issued from a node CSR.
pub struct SignedCertificate {
    /// The UUID carried in the CSR's Common Name — the node's identity.
    pub uuid: Uuid,
    pub cert_pem: String,
}

pub struct CertificateAuthority {
    ca_cert_pem: String,
    issuer_cert: Certificate,
    issuer_key: KeyPair,
    server_cert_pem: String,
    server_key_pem: String,
}

impl CertificateAuthority {
    /// Load the persisted root from `dir`, creating and persisting a new
    /// one on first start. Also issues the in-memory server certificate
    /// presented by the TLS listener, with `hosts` as subject alt names.
    pub fn load_or_create(dir: &Path, name: &str, hosts: &[String]) -> Result<Self, Error> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert_pem, issuer_cert, issuer_key) =
            if cert_path.exists() && key_path.exists() {
                let ca_cert_pem = std::fs::read_to_string(&cert_path)?;
                let key_pem = std::fs::read_to_string(&key_path)?;
                let issuer_key = KeyPair::from_pem(&key_pem)
                    .map_err(|e| Error::Certificate(format!("read {CA_KEY_FILE}: {e}")))?;
                // Rebuild the issuer from the persisted root so leaves keep
                // verifying against the `ca.crt` already handed to nodes.
                let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
                    .map_err(|e| Error::Certificate(format!("read {CA_CERT_FILE}: {e}")))?;
                let issuer_cert = params
                    .self_signed(&issuer_key)
                    .map_err(|e| Error::Certificate(format!("rebuild root: {e}")))?;
                tracing::debug!(path = %cert_path.display(), "loaded certificate authority");
                (ca_cert_pem, issuer_cert, issuer_key)
            } else {
                let issuer_key = KeyPair::generate()
                    .map_err(|e| Error::Certificate(format!("generate root key: {e}")))?;

                let mut params = CertificateParams::default();
                params.distinguished_name = DistinguishedName::new();
                params
                    .distinguished_name
                    .push(DnType::CommonName, format!("{name} CA"));
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::CrlSign,
                ];
                (params.not_before, params.not_after) = validity();

                let issuer_cert = params
                    .self_signed(&issuer_key)
                    .map_err(|e| Error::Certificate(format!("self-sign root: {e}")))?;
                let ca_cert_pem = issuer_cert.pem();

                std::fs::create_dir_all(dir)?;
                std::fs::write(&cert_path, &ca_cert_pem)?;
                std::fs::write(&key_path, issuer_key.serialize_pem())?;
                tracing::info!(path = %cert_path.display(), "created certificate authority");
                (ca_cert_pem, issuer_cert, issuer_key)
            };

        // The listener's server certificate is ephemeral: reissued on
        // every start, never persisted.
        let server_key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("generate server key: {e}")))?;
        let mut params = CertificateParams::new(hosts.to_vec())
            .map_err(|e| Error::Certificate(format!("server cert params: {e}")))?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        (params.not_before, params.not_after) = validity();
        let server_cert = params
            .signed_by(&server_key, &issuer_cert, &issuer_key)
            .map_err(|e| Error::Certificate(format!("sign server cert: {e}")))?;

        Ok(Self {
            ca_cert_pem,
            issuer_cert,
            issuer_key,
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        })
    }

    /// The PEM root served at `/ca.crt` and pushed during bootstrap.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Sign a node's PKCS#10 CSR. The subject is preserved, so the CSR's
    /// Common Name (the node's freshly generated UUID) becomes the leaf's
    /// identity; usage is restricted to client authentication.
    pub fn sign_request(&self, csr_pem: &str) -> Result<SignedCertificate, Error> {
        let uuid = csr_common_name_uuid(csr_pem)?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Certificate(format!("parse csr: {e}")))?;
        (csr.params.not_before, csr.params.not_after) = validity();
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.is_ca = IsCa::ExplicitNoCa;

        let cert = csr
            .signed_by(&self.issuer_cert, &self.issuer_key)
            .map_err(|e| Error::Certificate(format!("sign csr: {e}")))?;

        Ok(SignedCertificate {
            uuid,
            cert_pem: cert.pem(),
        })
    }

    /// Verify a peer leaf certificate (DER) against the root and extract
    /// the node UUID from its Common Name.
    pub fn verify_peer(&self, leaf_der: &[u8]) -> Result<Uuid, Error> {
        let (_, root_pem) = x509_parser::pem::parse_x509_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("root pem: {e:?}")))?;
        let root = root_pem
            .parse_x509()
            .map_err(|e| Error::Certificate(format!("root der: {e}")))?;
        let leaf = x509_parser::parse_x509_certificate(leaf_der)
            .map_err(|e| Error::Certificate(format!("leaf der: {e}")))?
            .1;

        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| Error::Certificate(format!("leaf not signed by root: {e}")))?;

        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| Error::Certificate("leaf has no common name".into()))?;
        Uuid::parse_str(cn)
            .map_err(|e| Error::Certificate(format!("common name is not a uuid: {e}")))
    }

    /// Build the rustls server config for the TLS listener. Client
    /// certificates are verified against the root when presented, but an
    /// anonymous handshake is still accepted — identification happens
    /// per-connection so a gui can attach without a certificate.
    pub fn server_tls_config(&self) -> Result<Arc<rustls::ServerConfig>, Error> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_cert_pem.as_bytes()) {
            let cert = cert.map_err(|e| Error::Certificate(format!("root pem: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::Certificate(format!("trust root: {e}")))?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::Certificate(format!("client verifier: {e}")))?;

        let certs = rustls_pemfile::certs(&mut self.server_cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Certificate(format!("server cert: {e}")))?;
        let key = rustls_pemfile::private_key(&mut self.server_key_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("server key: {e}")))?
            .ok_or_else(|| Error::Certificate("server key pem holds no key".into()))?;

        let mut config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| Error::Certificate(format!("server tls config: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Extract the Common Name of a PEM CSR as a UUID.
fn csr_common_name_uuid(csr_pem: &str) -> Result<Uuid, Error> {
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::prelude::FromDer;

    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("csr pem: {e:?}")))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| Error::Certificate(format!("csr der: {e}")))?;
    let cn = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Error::Certificate("csr has no common name".into()))?;
    Uuid::parse_str(cn)
        .map_err(|e| Error::Certificate(format!("csr common name is not a uuid: {e}")))
}
