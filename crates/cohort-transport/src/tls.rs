use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{BoxedStream, TransportError};

/// Subject name every Cohort certificate must carry.
///
/// Peers are identified by rank, not by host name, so all members verify
/// one shared name and decide trust purely by the certificate itself.
pub const TLS_SERVER_NAME: &str = "cohort.peer";

/// A member's certificate and private key.
pub struct TlsIdentity {
    certificate: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn new(certificate: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Self {
        Self { certificate, key }
    }

    /// Generate a throwaway self-signed identity for [`TLS_SERVER_NAME`].
    pub fn self_signed() -> Result<Self, TransportError> {
        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| TransportError::Config(e.to_string()))?;
        let mut params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
            .map_err(|e| TransportError::Config(e.to_string()))?;
        // distinct subjects keep trust anchors apart when many are loaded
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            format!("cohort-{}", uuid::Uuid::new_v4().simple()),
        );
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        Ok(Self::new(cert.der().clone(), PrivateKeyDer::Pkcs8(key)))
    }

    pub fn from_pem_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let certificate = CertificateDer::from_pem_file(cert.as_ref())
            .map_err(|e| pem_error(cert.as_ref(), e))?;
        let key =
            PrivateKeyDer::from_pem_file(key.as_ref()).map_err(|e| pem_error(key.as_ref(), e))?;
        Ok(Self::new(certificate, key))
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certificate: self.certificate.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

fn pem_error(path: &Path, e: rustls_pki_types::pem::Error) -> TransportError {
    TransportError::Config(format!("cannot read {}: {e:?}", path.display()))
}

/// Mutual-TLS settings for one member: its own identity plus the peer
/// certificates it is willing to talk to.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    identity: TlsIdentity,
    trusted: Vec<CertificateDer<'static>>,
}

impl TlsConfig {
    pub fn new(identity: TlsIdentity) -> Self {
        Self {
            identity,
            trusted: Vec::new(),
        }
    }

    pub fn from_pem_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(TlsIdentity::from_pem_files(cert, key)?))
    }

    /// Trust a peer certificate.
    pub fn trust(mut self, certificate: CertificateDer<'static>) -> Self {
        self.trusted.push(certificate);
        self
    }

    pub fn trust_pem_file(self, path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let certificate = CertificateDer::from_pem_file(path.as_ref())
            .map_err(|e| pem_error(path.as_ref(), e))?;
        Ok(self.trust(certificate))
    }

    pub fn identity(&self) -> &TlsIdentity {
        &self.identity
    }

    // A member always trusts its own certificate, which also keeps the
    // store non-empty as the client verifier requires.
    fn roots(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.add(self.identity.certificate.clone())?;
        for cert in &self.trusted {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }
}

/// Ready-to-use TLS connector/acceptor pair built from a [`TlsConfig`].
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn new(config: &TlsConfig) -> Result<Self, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(config.roots()?);
        let chain = vec![config.identity.certificate.clone()];

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(chain.clone(), config.identity.key.clone_key())?;

        let verifier = client_verifier(roots, provider.clone())?;
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, config.identity.key.clone_key())?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    /// Client side of the handshake (the dialing member).
    pub async fn connect(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError> {
        let name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(handshake_error)?;
        Ok(Box::new(tls))
    }

    /// Server side of the handshake (the accepting member).
    pub async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError> {
        let tls = self.acceptor.accept(stream).await.map_err(handshake_error)?;
        Ok(Box::new(tls))
    }
}

fn client_verifier(
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TransportError> {
    WebPkiClientVerifier::builder_with_provider(roots, provider)
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))
}

// Anything going wrong during the handshake is a trust failure for this
// edge, including the peer hanging up after rejecting our certificate.
fn handshake_error(e: std::io::Error) -> TransportError {
    match TransportError::from(e) {
        TransportError::Io(e) => TransportError::Tls(e.to_string()),
        other => other,
    }
}
