//! Hardened TLS policy shared by the static-certificate and ACME listeners.
//!
//! The policy pins TLS 1.2 as the floor, prefers P-256 then X25519, and allows
//! exactly six TLS 1.2 suites, all ECDHE (forward secret) with AEAD ciphers.
//! TLS 1.3 suites are fixed by the protocol itself (all ephemeral-key AEAD) and
//! are enabled alongside so modern clients negotiate 1.3.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::{self, cipher_suite, kx_group};
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::server::ResolvesServerCert;
use rustls::{NamedGroup, ProtocolVersion, ServerConfig, SupportedCipherSuite};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

/// ALPN token used by the ACME TLS-ALPN-01 challenge
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];

fn tls12_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

fn tls13_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to read PEM from {path}: {source}")]
    Pem {
        path: String,
        source: rustls_pki_types::pem::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Immutable TLS settings, built once per process.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    kx_groups: Vec<&'static dyn SupportedKxGroup>,
    cipher_suites: Vec<SupportedCipherSuite>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsPolicy {
    /// Build the hardened policy. `acme` adds the ACME challenge token to ALPN.
    pub fn hardened(acme: bool) -> Self {
        let mut alpn_protocols = Vec::with_capacity(3);
        if acme {
            alpn_protocols.push(ACME_TLS_ALPN.to_vec());
        }
        alpn_protocols.push(ALPN_H2.to_vec());
        alpn_protocols.push(ALPN_HTTP11.to_vec());

        Self {
            kx_groups: vec![kx_group::SECP256R1, kx_group::X25519],
            cipher_suites: tls12_suites(),
            alpn_protocols,
        }
    }

    /// Lowest protocol version a client can negotiate
    pub fn min_version(&self) -> ProtocolVersion {
        ProtocolVersion::TLSv1_2
    }

    /// The TLS 1.2 cipher-suite allow-list, in preference order
    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.cipher_suites
    }

    /// Curve preference, most preferred first
    pub fn curves(&self) -> Vec<NamedGroup> {
        self.kx_groups.iter().map(|group| group.name()).collect()
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    fn provider(&self) -> CryptoProvider {
        let mut cipher_suites = tls13_suites();
        cipher_suites.extend(self.cipher_suites.iter().copied());

        CryptoProvider {
            cipher_suites,
            kx_groups: self.kx_groups.clone(),
            ..aws_lc_rs::default_provider()
        }
    }

    fn finish(&self, mut config: ServerConfig) -> ServerConfig {
        config.alpn_protocols = self.alpn_protocols.clone();
        config.ignore_client_order = true;
        config
    }

    /// Server configuration that asks `resolver` for a certificate per handshake.
    pub fn with_cert_resolver(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<ServerConfig, TlsError> {
        let config = ServerConfig::builder_with_provider(Arc::new(self.provider()))
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        Ok(self.finish(config))
    }

    /// Server configuration serving a fixed certificate chain loaded from PEM files.
    pub fn with_pem_files(&self, cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
        let certs = load_certificates(cert_path)?;
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(|source| TlsError::Pem {
            path: key_path.display().to_string(),
            source,
        })?;

        let config = ServerConfig::builder_with_provider(Arc::new(self.provider()))
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(self.finish(config))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_error = |source| TlsError::Pem {
        path: path.display().to_string(),
        source,
    };

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}
