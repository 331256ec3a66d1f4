//! TLS settings for JSON-RPC endpoints reached over HTTPS (the API server proxy).

use super::Error;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, WebPkiSupportedAlgorithms},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use std::{fmt, sync::Arc};

/// PEM client certificate chain and private key.
#[derive(Clone)]
pub struct Identity {
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

impl Identity {
    /// Certificate chain followed by the key, as a single PEM bundle.
    pub fn pem(&self) -> Vec<u8> {
        let mut pem = self.certificate.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&self.key);
        pem
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificate", &self.certificate.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// How to authenticate the server and present ourselves to it.
#[derive(Clone, Debug, Default)]
pub struct Tls {
    /// Trusted roots (PEM). When set, only these are trusted.
    pub ca: Option<Vec<u8>>,
    pub identity: Option<Identity>,
    /// Skip server certificate verification.
    pub insecure: bool,
}

impl Tls {
    /// Whether the platform defaults suffice.
    pub fn is_default(&self) -> bool {
        self.ca.is_none() && self.identity.is_none() && !self.insecure
    }

    /// Build the rustls client configuration.
    pub fn client_config(&self) -> Result<ClientConfig, Error> {
        let provider = Arc::new(crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| Error::Tls(err.to_string()))?;
        let builder = if self.insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServer(algorithms)))
        } else {
            let ca = self.ca.as_deref().ok_or_else(|| {
                Error::Tls("no certificate authority configured".to_string())
            })?;
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_slice_iter(ca) {
                let cert = cert.map_err(|err| Error::Tls(format!("certificate authority: {err}")))?;
                roots
                    .add(cert)
                    .map_err(|err| Error::Tls(format!("certificate authority: {err}")))?;
            }
            if roots.is_empty() {
                return Err(Error::Tls("certificate authority: no certificates".to_string()));
            }
            builder.with_root_certificates(roots)
        };
        match &self.identity {
            Some(identity) => {
                let chain = CertificateDer::pem_slice_iter(&identity.certificate)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| Error::Tls(format!("client certificate: {err}")))?;
                let key = PrivateKeyDer::from_pem_slice(&identity.key)
                    .map_err(|err| Error::Tls(format!("client key: {err}")))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|err| Error::Tls(format!("client identity: {err}")))
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyServer(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyServer {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}
