//! TLS configuration for listeners and the outbound relay
//!
//! Server side: PEM certificate/key pairs loaded once at startup, turned
//! into acceptors for the implicit-TLS listeners and STARTTLS upgrades.
//! Client side: an opportunistic connector for outbound STARTTLS that does
//! not verify peer certificates, since remote exchanges are upgraded on a
//! best-effort basis and relay continues in plaintext when upgrade fails.

use crate::error::{MailError, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Server-side TLS configuration
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Load a certificate chain and private key from PEM files.
    /// PKCS#8 and PKCS#1 (RSA) keys are accepted.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("read certificates: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(MailError::Tls("no certificates found in file".to_string()));
        }
        debug!("loaded {} certificate(s)", cert_chain.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("read private keys: {}", e)))?;
        if keys.is_empty() {
            let key_file = File::open(key_path.as_ref())
                .map_err(|e| MailError::Tls(format!("open key file: {}", e)))?;
            let mut key_reader = BufReader::new(key_file);
            keys = rsa_private_keys(&mut key_reader)
                .map_err(|e| MailError::Tls(format!("read private keys: {}", e)))?;
        }
        if keys.is_empty() {
            return Err(MailError::Tls("no private key found in file".to_string()));
        }
        let private_key = keys.remove(0);

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                cert_chain.into_iter().map(Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| MailError::Tls(format!("create TLS config: {}", e)))?;

        info!("TLS configuration loaded from {:?}", cert_path.as_ref());

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

struct NoCertVerification;

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Connector for opportunistic outbound STARTTLS. Remote certificates are
/// not verified; the alternative is plaintext.
pub fn insecure_client_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// TLS server name for a `host` or `host:port` exchange address.
pub fn server_name(host: &str) -> Result<ServerName> {
    let host = host.split(':').next().unwrap_or(host);
    ServerName::try_from(host).map_err(|e| MailError::Tls(format!("invalid server name: {}", e)))
}

/// Generate a self-signed certificate for development and testing.
pub fn generate_self_signed_cert(domain: &str, cert_output: &Path, key_output: &Path) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::IpAddress("127.0.0.1".parse().map_err(|_| {
            MailError::Tls("invalid loopback address".to_string())
        })?),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("generate certificate: {}", e)))?;

    std::fs::write(
        cert_output,
        cert.serialize_pem()
            .map_err(|e| MailError::Tls(format!("serialize certificate: {}", e)))?,
    )
    .map_err(|e| MailError::Tls(format!("write certificate: {}", e)))?;

    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| MailError::Tls(format!("write private key: {}", e)))?;

    info!("self-signed certificate generated for {}", domain);
    Ok(())
}
