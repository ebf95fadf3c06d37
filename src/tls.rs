//! TLS termination and backend TLS.
//!
//! Server side: every listener certificate is loaded at startup, its
//! subject CN and DNS SANs become glob patterns, and a resolver picks
//! the certificate whose pattern matches the SNI name (falling back to
//! the first certificate). Client-certificate handling follows the
//! four verify modes: 0 none, 1 optional verified, 2 required
//! verified, 3 requested but not verified.
//!
//! Backend side: optional TLS with configurable SNI; the upstream
//! certificate is not verified, matching the usual
//! terminate-and-re-encrypt deployment where backends carry internal
//! certificates.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use base64::Engine;
use once_cell::sync::OnceCell;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DistinguishedName, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::ListenerTlsConfig;
use crate::error::{GantryError, GantryResult};

fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceCell<Arc<CryptoProvider>> = OnceCell::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

/// Runtime TLS state of a listener
#[derive(Clone)]
pub struct TlsSettings {
    pub acceptor: TlsAcceptor,
    /// Verify mode 0..=3 as configured
    pub client_verify: u8,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("client_verify", &self.client_verify)
            .finish()
    }
}

/// One loaded certificate with its match patterns
struct SniCert {
    patterns: Vec<String>,
    key: Arc<CertifiedKey>,
}

/// Certificate resolver: SNI name against CN/SAN globs, first
/// certificate as the default.
struct SniResolver {
    certs: Vec<SniCert>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SniResolver({} certs)", self.certs.len())
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            for cert in &self.certs {
                if cert.patterns.iter().any(|p| glob_match(p, name)) {
                    return Some(cert.key.clone());
                }
            }
        }
        self.certs.first().map(|c| c.key.clone())
    }
}

/// Build the TLS acceptor for a listener
pub fn build_listener_tls(config: &ListenerTlsConfig) -> GantryResult<TlsSettings> {
    let mut sni_certs = Vec::new();
    for cert_config in &config.certificates {
        let chain = load_certs(&cert_config.cert_path)?;
        let key = load_key(&cert_config.key_path)?;
        let patterns = cert_names(&chain[0])?;
        info!(
            cert = %cert_config.cert_path,
            names = ?patterns,
            "loaded listener certificate"
        );
        let signing_key = provider()
            .key_provider
            .load_private_key(key)
            .map_err(|e| GantryError::tls(format!("unusable private key: {}", e)))?;
        sni_certs.push(SniCert {
            patterns,
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
        });
    }

    let resolver = Arc::new(SniResolver { certs: sni_certs });
    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GantryError::tls(e.to_string()))?;

    let server_config = match config.client_verify {
        0 => builder
            .with_no_client_auth()
            .with_cert_resolver(resolver),
        1 | 2 => {
            let ca_path = config
                .ca_path
                .as_ref()
                .ok_or_else(|| GantryError::config("client_verify requires ca_path"))?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| GantryError::tls(format!("bad CA certificate: {}", e)))?;
            }
            let verifier_builder =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider());
            let verifier = if config.client_verify == 1 {
                verifier_builder.allow_unauthenticated().build()
            } else {
                verifier_builder.build()
            }
            .map_err(|e| GantryError::tls(format!("client verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_cert_resolver(resolver)
        }
        3 => builder
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
            .with_cert_resolver(resolver),
        other => {
            return Err(GantryError::config(format!(
                "client_verify {} out of range",
                other
            )))
        }
    };

    Ok(TlsSettings {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        client_verify: config.client_verify,
    })
}

/// TLS client configuration for speaking to a backend. The upstream
/// certificate is not verified.
pub fn build_backend_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();
    CONFIG
        .get_or_init(|| {
            let config = ClientConfig::builder_with_provider(provider())
                .with_safe_default_protocol_versions()
                .expect("default protocol versions")
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoServerVerify::new()))
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

fn load_certs(path: &str) -> GantryResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| GantryError::config(format!("cannot open {}: {}", path, e)))?;
    let chain: Vec<_> = certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| GantryError::tls(format!("cannot parse {}: {}", path, e)))?;
    if chain.is_empty() {
        return Err(GantryError::tls(format!("no certificates in {}", path)));
    }
    Ok(chain)
}

fn load_key(path: &str) -> GantryResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| GantryError::config(format!("cannot open {}: {}", path, e)))?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| GantryError::tls(format!("cannot parse {}: {}", path, e)))?
        .ok_or_else(|| GantryError::tls(format!("no private key in {}", path)))
}

/// Extract the subject CN and DNS SANs as SNI match patterns
fn cert_names(cert: &CertificateDer<'_>) -> GantryResult<Vec<String>> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| GantryError::tls(format!("cannot parse certificate: {}", e)))?;

    let mut names = Vec::new();
    if let Some(cn) = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        names.push(cn.to_string());
    }
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                if !names.iter().any(|n| n == dns) {
                    names.push(dns.to_string());
                }
            }
        }
    }
    if names.is_empty() {
        return Err(GantryError::tls(
            "certificate has neither CN nor DNS SANs".to_string(),
        ));
    }
    Ok(names)
}

/// Case-insensitive glob: `*` matches any run, `?` one character.
/// This is what certificate wildcards reduce to for SNI selection.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc.eq_ignore_ascii_case(nc) => {
                inner(&p[1..], &n[1..])
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Details of an established client TLS session, used for the
/// X-SSL request headers.
#[derive(Debug, Clone, Default)]
pub struct TlsClientInfo {
    pub version: Option<String>,
    pub cipher: Option<String>,
    pub peer_cert: Option<Vec<u8>>,
}

impl TlsClientInfo {
    /// Capture details from a finished server-side handshake
    pub fn from_connection(conn: &rustls::ServerConnection) -> Self {
        TlsClientInfo {
            version: conn.protocol_version().map(|v| format!("{:?}", v)),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            peer_cert: conn
                .peer_certificates()
                .and_then(|c| c.first())
                .map(|c| c.as_ref().to_vec()),
        }
    }

    /// Build the X-SSL header lines appended to forwarded requests.
    /// Certificate details appear only when verification was on and a
    /// certificate was presented.
    pub fn header_lines(&self, client_verify: u8) -> Vec<String> {
        let mut lines = Vec::new();
        if let (Some(version), Some(cipher)) = (&self.version, &self.cipher) {
            lines.push(format!("X-SSL-cipher: {}/{}", version, cipher));
        }

        let der = match (&self.peer_cert, client_verify) {
            (Some(der), v) if v > 0 => der,
            _ => return lines,
        };
        let parsed = match X509Certificate::from_der(der) {
            Ok((_, c)) => c,
            Err(e) => {
                debug!("unparseable client certificate: {}", e);
                return lines;
            }
        };

        lines.push(format!("X-SSL-Subject: {}", parsed.subject()));
        lines.push(format!("X-SSL-Issuer: {}", parsed.issuer()));
        lines.push(format!(
            "X-SSL-notBefore: {}",
            parsed.validity().not_before
        ));
        lines.push(format!("X-SSL-notAfter: {}", parsed.validity().not_after));
        lines.push(format!("X-SSL-serial: {}", parsed.raw_serial_as_string()));
        lines.push(format!(
            "X-SSL-certificate: {}",
            base64::engine::general_purpose::STANDARD.encode(der)
        ));
        lines
    }
}

/// Client-certificate "verifier" for mode 3: ask for a certificate,
/// accept whatever arrives (or nothing).
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        AcceptAnyClientCert {
            provider: provider(),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Backend-side verifier that accepts any server certificate
#[derive(Debug)]
struct NoServerVerify {
    provider: Arc<CryptoProvider>,
}

impl NoServerVerify {
    fn new() -> Self {
        NoServerVerify {
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for NoServerVerify {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
