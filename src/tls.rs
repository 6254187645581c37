use anyhow::{Context, Result, anyhow, bail};
use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tracing::{debug, warn};

use crate::config::{InboundTls, TrustPolicy};

pub fn load_server_config(tls_config: &InboundTls) -> Result<rustls::ServerConfig> {
    let cert_chain = load_certs(&tls_config.cert_file)?;
    if cert_chain.is_empty() {
        return Err(anyhow!(
            "No certificates found in certificate file: {}",
            tls_config.cert_file.display()
        ));
    }

    let key_file = File::open(&tls_config.key_file).with_context(|| {
        format!(
            "Failed to open private key file: {}",
            tls_config.key_file.display()
        )
    })?;
    let private_key = private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key file")?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    server_config(cert_chain, private_key)
}

pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .context("Failed to create TLS server config")
}

pub fn load_client_config(trust: &TrustPolicy) -> Result<rustls::ClientConfig> {
    match trust {
        TrustPolicy::Insecure => Ok(insecure_client_config()),
        TrustPolicy::Bundle(path) => {
            let ca_certs = load_certs(path)?;
            if ca_certs.is_empty() {
                bail!(
                    "Failed to load CA certificates from {}: Invalid certificate data",
                    path.display()
                );
            }
            let mut roots = RootCertStore::empty();
            for cert in ca_certs {
                roots
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
            }
            Ok(client_config(roots))
        }
        TrustPolicy::System => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!(error = %error, "Failed to load a system certificate");
            }
            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "Loaded system trust store");
            if roots.is_empty() {
                warn!("System trust store is empty; outbound TLS verification will fail");
            }
            Ok(client_config(roots))
        }
    }
}

#[must_use]
pub fn client_config(roots: RootCertStore) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Client config that accepts whatever certificate the remote presents.
#[must_use]
pub fn insecure_client_config() -> rustls::ClientConfig {
    let mut config = client_config(RootCertStore::empty());
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoCertificateVerification));
    config
}

/// Name the remote certificate must be issued for.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .with_context(|| format!("Invalid TLS server name: {host}"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {}", path.display()))?;
    certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate file: {}", path.display()))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
