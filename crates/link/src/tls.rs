//! TLS authentication for connections.
//!
//! The server side presents a certificate and asks nothing of the client.
//! The client side checks the server under a [`ClientValidation`] policy.
//! Once the handshake is done the stream is handed to
//! [`Connection::from_stream`] and treated as an opaque byte stream.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::config::LinkConfig;
use crate::connection::{Connection, Role};
use crate::error::LinkError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain and key a server authenticates with.
#[derive(Clone)]
pub struct TlsServerIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
}

impl TlsServerIdentity {
    pub fn from_der(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self, LinkError> {
        if chain.is_empty() {
            return Err(LinkError::Certificate("certificate chain is empty".into()));
        }
        Ok(Self {
            chain,
            key: Arc::new(key),
        })
    }

    /// Load a PEM certificate chain and a PEM private key.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self, LinkError> {
        let chain = load_certs(cert)?;
        let key = PrivateKeyDer::from_pem_file(key)
            .map_err(|e| LinkError::Certificate(format!("{}: {e}", key.display())))?;
        Self::from_der(chain, key)
    }

    /// Fingerprint of the leaf certificate, for clients that pin it.
    pub fn thumbprint(&self) -> Thumbprint {
        Thumbprint::of(&self.chain[0])
    }

    pub fn acceptor(&self) -> Result<tokio_rustls::TlsAcceptor, LinkError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
    }
}

impl fmt::Debug for TlsServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerIdentity")
            .field("chain_len", &self.chain.len())
            .field("thumbprint", &self.thumbprint().to_string())
            .finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, LinkError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| LinkError::Certificate(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(LinkError::Certificate(format!("{}: no certificates found", path.display())));
    }
    Ok(certs)
}

/// SHA-256 fingerprint of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thumbprint([u8; 32]);

impl Thumbprint {
    pub fn of(cert: &CertificateDer<'_>) -> Self {
        Self(Sha256::digest(cert.as_ref()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Thumbprint {
    type Err = LinkError;

    /// Hex, case-insensitive, with or without `:` or space separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !matches!(b, b':' | b' ' | b'-'))
            .collect();
        if digits.len() != 64 {
            return Err(LinkError::Certificate(format!(
                "thumbprint must be 64 hex digits, got {}",
                digits.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hi = hex_value(pair[0]);
            let lo = hex_value(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => return Err(LinkError::Certificate(format!("invalid thumbprint '{s}'"))),
            }
        }
        Ok(Self(out))
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({self})")
    }
}

/// How a client decides whether to trust the server it connects to.
#[derive(Debug, Clone)]
pub enum ClientValidation {
    /// Standard chain validation against the webpki roots plus `extra_roots`
    /// (PEM files).
    RootCa { extra_roots: Vec<PathBuf> },
    /// Accept exactly the leaf certificate with this fingerprint.
    Thumbprint(Thumbprint),
    /// Accept any certificate. Development only.
    #[cfg(feature = "dangerous-skip-verify")]
    Skip,
}

impl Default for ClientValidation {
    fn default() -> Self {
        Self::RootCa {
            extra_roots: Vec::new(),
        }
    }
}

impl ClientValidation {
    pub fn client_config(&self) -> Result<ClientConfig, LinkError> {
        let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
        let config = match self {
            Self::RootCa { extra_roots } => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                for path in extra_roots {
                    for cert in load_certs(path)? {
                        roots.add(cert)?;
                    }
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            Self::Thumbprint(expected) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(*expected)))
                .with_no_client_auth(),
            #[cfg(feature = "dangerous-skip-verify")]
            Self::Skip => {
                warn!("TLS server verification is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier::new()))
                    .with_no_client_auth()
            }
        };
        Ok(config)
    }
}

/// Checks handshake signatures normally but trusts only one leaf certificate.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: Thumbprint,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(expected: Thumbprint) -> Self {
        Self {
            expected,
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = Thumbprint::of(end_entity);
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(expected = %self.expected, actual = %actual, "server certificate thumbprint mismatch");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(feature = "dangerous-skip-verify")]
#[derive(Debug)]
struct AcceptAnyVerifier {
    provider: Arc<CryptoProvider>,
}

#[cfg(feature = "dangerous-skip-verify")]
impl AcceptAnyVerifier {
    fn new() -> Self {
        Self { provider: provider() }
    }
}

#[cfg(feature = "dangerous-skip-verify")]
impl ServerCertVerifier for AcceptAnyVerifier {
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
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Server side of the handshake over an accepted TCP stream.
#[instrument(skip_all, fields(peer = ?tcp.peer_addr().ok()))]
pub async fn accept(
    tcp: TcpStream,
    acceptor: &tokio_rustls::TlsAcceptor,
    config: LinkConfig,
) -> Result<Connection, LinkError> {
    tcp.set_nodelay(true)?;
    let stream = acceptor.accept(tcp).await?;
    debug!("TLS handshake complete");
    Ok(Connection::from_stream(stream, Role::Server, config))
}

/// Client side: dial `addr` and authenticate `server_name` under `validation`.
#[instrument(skip(validation, config))]
pub async fn connect(
    addr: &str,
    server_name: &str,
    validation: &ClientValidation,
    config: LinkConfig,
) -> Result<Connection, LinkError> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| LinkError::InvalidServerName(server_name.to_string()))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(validation.client_config()?));

    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let stream = connector.connect(name, tcp).await?;
    debug!("TLS handshake complete");
    Ok(Connection::from_stream(stream, Role::Client, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn thumbprint_parsing_ignores_case_and_separators() {
        let plain: Thumbprint = HEX.parse().unwrap();
        let upper: Thumbprint = HEX.to_uppercase().parse().unwrap();
        let colons = HEX
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        let colons: Thumbprint = colons.parse().unwrap();

        assert_eq!(plain, upper);
        assert_eq!(plain, colons);
        assert_eq!(plain.to_string(), HEX);
        assert_eq!(plain.as_bytes()[1], 0x11);
    }

    #[test]
    fn thumbprint_rejects_bad_input() {
        assert!("abcd".parse::<Thumbprint>().is_err());
        let bad = format!("zz{}", &HEX[2..]);
        assert!(bad.parse::<Thumbprint>().is_err());
    }

    #[test]
    fn thumbprint_of_certificate_is_sha256() {
        let der = CertificateDer::from(b"not really a certificate".to_vec());
        let expected: [u8; 32] = Sha256::digest(b"not really a certificate").into();
        assert_eq!(Thumbprint::of(&der).as_bytes(), &expected);
    }

    #[test]
    fn pinned_verifier_accepts_only_the_pinned_leaf() {
        let good = CertificateDer::from(vec![1u8, 2, 3]);
        let other = CertificateDer::from(vec![4u8, 5, 6]);
        let verifier = PinnedCertVerifier::new(Thumbprint::of(&good));
        let name = ServerName::try_from("runner.local").unwrap();

        assert!(verifier
            .verify_server_cert(&good, &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_server_cert(&other, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn default_policy_is_root_ca() {
        assert!(matches!(ClientValidation::default(), ClientValidation::RootCa { .. }));
        assert!(ClientValidation::default().client_config().is_ok());
    }

    #[test]
    fn identity_requires_a_certificate() {
        let key = PrivateKeyDer::Pkcs8(vec![0u8; 8].into());
        assert!(TlsServerIdentity::from_der(Vec::new(), key).is_err());
    }

    #[test]
    fn missing_pem_file_is_a_certificate_error() {
        let err = load_certs(Path::new("/nonexistent/taskline.pem")).unwrap_err();
        assert!(matches!(err, LinkError::Certificate(_)));
    }
}
