//! # TLS Identity and QUIC Configuration
//!
//! This module provides the cryptographic collaborators consumed by the
//! transport facade:
//!
//! - **Certificates**: self-signed Ed25519 certificates carrying the peer's
//!   public key; the key IS the identity, no CA is involved
//! - **Verification**: custom rustls verifiers that bind the handshake to an
//!   expected [`PeerId`] and deliver the authenticated remote public key
//!   through a single-shot channel
//! - **QUIC parameters**: the shared parameter set ([`QuicParams`]) applied to
//!   both the client and server role, including the stateless-reset key
//!   derived from the transport's long-lived private key
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` APIs are used intentionally - we implement our own
//! certificate verification that binds identity to public key, not to
//! traditional CA-signed certificate chains.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::Sha256;
use tokio::sync::oneshot;

use crate::identity::{Keypair, PeerId};

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier. All burrow connections use this to prevent
/// accidental cross-protocol connections.
pub const ALPN: &[u8] = b"burrow";

/// HKDF info string for the stateless-reset key derivation.
pub const STATELESS_RESET_KEY_INFO: &[u8] = b"libp2p quic stateless reset key";

/// QUIC version numbers advertised by both roles.
pub const QUIC_VERSION_DRAFT_29: u32 = 0xff00_001d;
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// QUIC parameter set shared by the client and server role.
///
/// Each role receives its own clone; both carry the stateless-reset key
/// derived deterministically from the transport's private key, so reset
/// tokens stay valid across restarts with the same key.
#[derive(Clone)]
pub struct QuicParams {
    /// Incoming bidirectional stream limit per connection.
    pub max_incoming_streams: u32,
    /// Per-stream receive window in bytes.
    pub stream_receive_window: u64,
    /// Per-connection receive window in bytes.
    pub connection_receive_window: u64,
    /// Keep-alive ping interval.
    pub keep_alive_interval: Duration,
    /// Advertised QUIC versions, most preferred first.
    pub supported_versions: Vec<u32>,
    /// HMAC key for stateless reset tokens.
    pub stateless_reset_key: [u8; 32],
}

impl QuicParams {
    /// Build the parameter set for a transport identified by `keypair`.
    pub fn for_keypair(keypair: &Keypair) -> Self {
        Self {
            max_incoming_streams: 256,
            stream_receive_window: 10 * (1 << 20),
            connection_receive_window: 15 * (1 << 20),
            keep_alive_interval: Duration::from_secs(15),
            supported_versions: vec![QUIC_VERSION_DRAFT_29, QUIC_VERSION_1],
            stateless_reset_key: derive_stateless_reset_key(keypair),
        }
    }
}

impl std::fmt::Debug for QuicParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicParams")
            .field("max_incoming_streams", &self.max_incoming_streams)
            .field("supported_versions", &self.supported_versions)
            .finish_non_exhaustive()
    }
}

/// Derive the 32-byte stateless-reset key from the raw private key bytes:
/// HKDF-SHA256 with empty salt and a fixed info string.
pub fn derive_stateless_reset_key(keypair: &Keypair) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, &keypair.secret_key_bytes());
    let mut key = [0u8; 32];
    hk.expand(STATELESS_RESET_KEY_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Endpoint-level quinn configuration: reset key and version set.
pub(crate) fn endpoint_config(params: &QuicParams) -> quinn::EndpointConfig {
    let reset_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &params.stateless_reset_key);
    let mut config = quinn::EndpointConfig::new(Arc::new(reset_key));
    config.supported_versions(params.supported_versions.clone());
    config
}

fn transport_config(params: &QuicParams) -> quinn::TransportConfig {
    let mut config = quinn::TransportConfig::default();
    config.max_concurrent_bidi_streams(quinn::VarInt::from_u32(params.max_incoming_streams));
    // Unidirectional streams are not part of the protocol.
    config.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
    config.stream_receive_window(
        quinn::VarInt::try_from(params.stream_receive_window)
            .expect("10 MiB fits in a varint"),
    );
    config.receive_window(
        quinn::VarInt::try_from(params.connection_receive_window)
            .expect("15 MiB fits in a varint"),
    );
    config.keep_alive_interval(Some(params.keep_alive_interval));
    config
}

/// Wrap a rustls server config into a quinn server config with the shared
/// transport parameters applied. Address-validation tokens are never
/// required, so all tokens are accepted.
pub(crate) fn server_quic_config(
    crypto: rustls::ServerConfig,
    params: &QuicParams,
) -> Result<quinn::ServerConfig> {
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.migration(true);
    server_config.transport = Arc::new(transport_config(params));
    Ok(server_config)
}

pub(crate) fn client_quic_config(
    crypto: rustls::ClientConfig,
    params: &QuicParams,
) -> Result<quinn::ClientConfig> {
    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config(params)));
    Ok(client_config)
}

/// TLS identity helper: owns the local certificate chain and produces
/// per-handshake rustls configurations.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    pkcs8: Vec<u8>,
    local_peer: PeerId,
}

impl TlsIdentity {
    pub fn new(keypair: &Keypair) -> Result<Self> {
        let (certs, pkcs8) = generate_ed25519_cert(keypair)?;
        Ok(Self {
            certs,
            pkcs8,
            local_peer: keypair.peer_id(),
        })
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.pkcs8.clone()))
    }

    /// Server-role TLS configuration. Client certificates are mandatory and
    /// must carry a valid Ed25519 key; identity-level admission decisions are
    /// left to the connection gater.
    pub fn server_crypto(&self) -> Result<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
            .with_single_cert(self.certs.clone(), self.private_key())
            .context("failed to create server TLS config")?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }

    /// Client-role TLS configuration pinned to `remote`, plus a single-shot
    /// channel that carries the authenticated remote public key once the
    /// handshake has verified the peer certificate.
    pub fn config_for_peer(
        &self,
        remote: &PeerId,
    ) -> Result<(rustls::ClientConfig, oneshot::Receiver<VerifyingKey>)> {
        let (key_tx, key_rx) = oneshot::channel();
        let verifier = PeerCertVerifier {
            expected: *remote,
            verified_key: Mutex::new(Some(key_tx)),
        };

        let mut config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(self.certs.clone(), self.private_key())
            .context("failed to create client TLS config with client auth")?;
        config.alpn_protocols = vec![ALPN.to_vec()];

        Ok((config, key_rx))
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

/// Encode a peer id as an SNI-compatible name. Hex of 32 bytes is 64
/// characters, one over the DNS label limit, so it is split in two labels.
pub(crate) fn peer_id_to_sni(peer: &PeerId) -> String {
    let hex = hex::encode(peer.as_bytes());
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, Vec<u8>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    // PKCS#8 v1 wrapping of the raw Ed25519 seed (RFC 8410).
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["burrow".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    Ok((vec![cert_der], pkcs8))
}

pub(crate) fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Extract the authenticated remote key from a handshaken quinn connection.
/// Returns `None` when no certificate was presented or it is not Ed25519.
pub(crate) fn extract_verified_peer(
    connection: &quinn::Connection,
) -> Option<(PeerId, VerifyingKey)> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    let verifying_key = VerifyingKey::from_bytes(&public_key).ok()?;
    Some((PeerId::from_bytes(public_key), verifying_key))
}

/// Server-side verifier: any syntactically valid Ed25519 client certificate
/// is admitted; the listener reads the identity out of the connection
/// afterwards and the gater decides admission.
#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if VerifyingKey::from_bytes(&public_key).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Client-side verifier pinned to the dialed peer. On success the extracted
/// public key is pushed through the single-shot delivery channel, where the
/// facade picks it up after the handshake completes.
#[derive(Debug)]
struct PeerCertVerifier {
    expected: PeerId,
    verified_key: Mutex<Option<oneshot::Sender<VerifyingKey>>>,
}

impl rustls::client::danger::ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if PeerId::from_bytes(public_key) != self.expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        let verifying_key = VerifyingKey::from_bytes(&public_key).map_err(|_| {
            rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )
        })?;

        // Receiver may already be gone if the dial was cancelled.
        if let Ok(mut slot) = self.verified_key.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(verifying_key);
            }
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
