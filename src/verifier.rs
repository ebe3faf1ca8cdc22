//! Client certificate verification policy.
//!
//! This proxy only terminates TLS; it does not itself decide whether a
//! client certificate identifies an authorized user — that's the job of the
//! backend (via PAM/sssd, reading the certificate file this crate's
//! [`crate::cert_store`] hands it). So verification here only needs to
//! reject certificates that are cryptographically broken (expired, wrong
//! signature algorithm, etc), while deliberately accepting certificates
//! whose issuer this process doesn't recognize: chain-of-trust is someone
//! else's problem.
//!
//! The original implementation expresses this by running full GnuTLS
//! verification and then clearing the `INVALID`, `SIGNER_NOT_FOUND`, and
//! `SIGNER_NOT_CA` bits out of the resulting status before deciding whether
//! to fail the handshake. rustls reports failures as typed `Error` variants
//! rather than a bitmask, so the same policy is reproduced here by letting
//! `rustls`'s `WebPkiClientVerifier` do full chain validation and then
//! reclassifying `UnknownIssuer`-shaped failures as acceptable.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};

/// Wraps an inner [`ClientCertVerifier`] and downgrades "don't recognize
/// this issuer" failures to acceptance, while still rejecting certificates
/// that are malformed, expired, or use an unsupported signature scheme.
pub struct LenientClientCertVerifier {
    inner: Option<Arc<dyn ClientCertVerifier>>,
}

impl fmt::Debug for LenientClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LenientClientCertVerifier").finish()
    }
}

impl LenientClientCertVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>) -> Self {
        LenientClientCertVerifier { inner: Some(inner) }
    }

    /// No CA configured at all: accept any certificate (or none), deferring
    /// all identity decisions to the backend.
    pub fn permissive() -> Self {
        LenientClientCertVerifier { inner: None }
    }

    fn ignorable(err: &TlsError) -> bool {
        matches!(
            err,
            TlsError::InvalidCertificate(details)
                if matches!(
                    details,
                    rustls::CertificateError::UnknownIssuer
                        | rustls::CertificateError::UnhandledCriticalExtension
                )
        )
    }
}

impl ClientCertVerifier for LenientClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.inner {
            Some(inner) => inner.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let Some(inner) = &self.inner else {
            return Ok(ClientCertVerified::assertion());
        };

        match inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(verified) => Ok(verified),
            Err(e) if Self::ignorable(&e) => Ok(ClientCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        match &self.inner {
            Some(inner) => inner.verify_tls12_signature(message, cert, dss),
            // No CA configured, so there's no chain to ignore parts of — but
            // the CertificateVerify signature itself still proves the peer
            // holds the private key for the cert it presented, and that
            // check doesn't depend on a trust anchor existing at all.
            None => rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            ),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        match &self.inner {
            Some(inner) => inner.verify_tls13_signature(message, cert, dss),
            None => rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            ),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(inner) => inner.supported_verify_schemes(),
            None => rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}
