//! Certificate fingerprints: the key used to partition sessions across
//! backend ws instances.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// SHA-256 digest of a DER-encoded certificate, rendered as 64 lowercase hex
/// characters.
///
/// The fingerprint of "no client certificate" is the SHA-256 of the empty
/// string, `e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855`
/// — the original implementation hashes an empty buffer rather than special
/// casing the absence of a certificate, and this crate preserves that so the
/// same lookup path in [`crate::cert_store`] handles both cases uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hashes a DER-encoded certificate and returns its fingerprint.
    pub fn of_der(der: &[u8]) -> Self {
        Self::of_bytes(der)
    }

    fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Fingerprint(hex::encode(digest))
    }

    /// The sentinel fingerprint used when the client presented no
    /// certificate.
    pub fn empty_cert() -> Self {
        Self::of_bytes(&[])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if this is the "no client certificate" sentinel.
    pub fn is_empty_cert(&self) -> bool {
        *self == Self::empty_cert()
    }

    fn is_valid_hex64(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid_hex64(s) {
            Ok(Fingerprint(s.to_owned()))
        } else {
            Err(Error::InvalidFingerprint(s.to_owned()))
        }
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cert_is_the_well_known_sha256_of_nothing() {
        assert_eq!(
            Fingerprint::empty_cert().as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn of_der_is_deterministic() {
        let a = Fingerprint::of_der(b"certificate-bytes");
        let b = Fingerprint::of_der(b"certificate-bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn of_der_distinguishes_inputs() {
        let a = Fingerprint::of_der(b"one");
        let b = Fingerprint::of_der(b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn parses_lowercase_hex64() {
        let fp = Fingerprint::empty_cert();
        let parsed: Fingerprint = fp.as_str().parse().unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn rejects_uppercase_and_wrong_length() {
        assert!("E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
            .parse::<Fingerprint>()
            .is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }
}
