//! Default TLS contexts, rebuilt on configuration reload.

use crate::config::ConfigFile;
use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Default)]
pub(crate) struct TlsDefaults {
    pub(crate) server: Option<Arc<ServerConfig>>,
    pub(crate) client: Option<Arc<ClientConfig>>,
}

/// Builds the default server and client contexts from `network.ssl.*`.
pub(crate) fn build_tls_defaults(file: &ConfigFile) -> Result<TlsDefaults> {
    let mut default_certificate = String::new();
    let mut default_private_key = String::new();
    let mut trusted_ca_path = String::new();

    let value = file.query(&["network", "ssl", "default_certificate"])?;
    if let Some(path) = value.as_str() {
        default_certificate = path.to_string();
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `network.ssl.default_certificate`: expecting a `string`, got `{}`",
            value
        );
    }

    let value = file.query(&["network", "ssl", "default_private_key"])?;
    if let Some(path) = value.as_str() {
        default_private_key = path.to_string();
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `network.ssl.default_private_key`: expecting a `string`, got `{}`",
            value
        );
    }

    let value = file.query(&["network", "ssl", "trusted_ca_path"])?;
    if let Some(path) = value.as_str() {
        trusted_ca_path = path.to_string();
    } else if !value.is_null() {
        log::warn!(
            "Ignoring `network.ssl.trusted_ca_path`: expecting a `string`, got `{}`",
            value
        );
    }

    if !default_certificate.is_empty() && default_private_key.is_empty() {
        return Err(anyhow!("`network.ssl.default_private_key` missing"));
    }
    if default_certificate.is_empty() && !default_private_key.is_empty() {
        return Err(anyhow!("`network.ssl.default_certificate` missing"));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = if default_certificate.is_empty() {
        None
    } else {
        Some(Arc::new(build_server_config(
            provider.clone(),
            Path::new(&default_certificate),
            Path::new(&default_private_key),
        )?))
    };

    let client = Arc::new(build_client_config(provider, &trusted_ca_path)?);

    Ok(TlsDefaults {
        server,
        client: Some(client),
    })
}

fn build_server_config(
    provider: Arc<CryptoProvider>,
    cert_path: &Path,
    key_path: &Path,
) -> Result<ServerConfig> {
    let certs = load_certificates(cert_path)?;
    if certs.is_empty() {
        return Err(anyhow!(
            "no certificates found in '{}'",
            cert_path.display()
        ));
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("could not open private key '{}'", key_path.display()))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("could not parse private key '{}'", key_path.display()))?
        .ok_or_else(|| anyhow!("no private key found in '{}'", key_path.display()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("could not select TLS protocol versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            anyhow!(
                "error validating certificate '{}' and private key '{}': {}",
                cert_path.display(),
                key_path.display(),
                e
            )
        })?;

    Ok(config)
}

fn build_client_config(provider: Arc<CryptoProvider>, trusted_ca_path: &str) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("could not select TLS protocol versions: {}", e))?;

    if trusted_ca_path.is_empty() {
        log::warn!(
            "CA certificate validation has been disabled. This configuration is not \
             recommended for production use. Set `network.ssl.trusted_ca_path` to enable it."
        );
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    let entries = std::fs::read_dir(trusted_ca_path)
        .with_context(|| format!("could not open trusted CA directory '{}'", trusted_ca_path))?;

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(_) => continue,
        };
        if !path.is_file() {
            continue;
        }
        match load_certificates(&path) {
            Ok(certs) => {
                for cert in certs {
                    if let Err(err) = roots.add(cert) {
                        log::warn!(
                            "Ignoring certificate from '{}': {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
            Err(err) => log::warn!("Ignoring '{}': {:#}", path.display(), err),
        }
    }

    if roots.is_empty() {
        return Err(anyhow!(
            "no usable CA certificates found under '{}'",
            trusted_ca_path
        ));
    }

    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not open certificate file '{}'", path.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("could not parse certificates in '{}'", path.display()))?;
    Ok(certs)
}

/// Accepts any server certificate. Installed only when no trusted CA
/// path is configured, with a loud warning.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

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
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
