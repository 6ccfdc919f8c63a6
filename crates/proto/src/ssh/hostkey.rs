//! Server host keys (RFC 4253 Section 6.6).
//!
//! Only `ssh-rsa` is supported: an RSA public key whose signature over the
//! exchange hash uses PKCS#1 v1.5 with SHA-1.
//!
//! ```text
//! host key blob:   string "ssh-rsa" || mpint e || mpint n
//! signature blob:  string "ssh-rsa" || string rsa_signature
//! ```
//!
//! Whether a host key is *trusted* is the caller's decision, made through a
//! [`HostKeyCheck`] that sees the raw blob before any signature is checked.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::hostkey::{fingerprint, FingerprintCheck, HostKeyCheck};
//!
//! let blob = b"not really a key";
//! let check = FingerprintCheck::new(fingerprint(blob));
//! assert!(check.check(blob).is_ok());
//! assert!(check.check(b"another key").is_err());
//! ```

use crate::ssh::codec::{Decoder, Encoder};
use base64::Engine;
use kestrel_platform::{KestrelError, KestrelResult};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Host-key algorithm name.
pub const SSH_RSA: &str = "ssh-rsa";

/// Decides whether the server's host key is trusted.
///
/// Receives the raw K_S blob from KEXDH_REPLY. Returning an error aborts
/// the handshake with [`KestrelError::Trust`].
pub trait HostKeyCheck: Send + Sync {
    /// Accepts or rejects `host_key`.
    fn check(&self, host_key: &[u8]) -> KestrelResult<()>;
}

impl<F> HostKeyCheck for F
where
    F: Fn(&[u8]) -> KestrelResult<()> + Send + Sync,
{
    fn check(&self, host_key: &[u8]) -> KestrelResult<()> {
        self(host_key)
    }
}

/// Trusts every host key.
///
/// Only suitable for tests and for callers that pin keys some other way.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyCheck for AcceptAnyHostKey {
    fn check(&self, _host_key: &[u8]) -> KestrelResult<()> {
        Ok(())
    }
}

/// Trusts host keys whose SHA256 fingerprint is in a fixed set.
#[derive(Debug, Clone)]
pub struct FingerprintCheck {
    allowed: Vec<String>,
}

impl FingerprintCheck {
    /// Trusts exactly one fingerprint, e.g. `SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8`.
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            allowed: vec![fingerprint.into()],
        }
    }

    /// Also trusts `fingerprint`.
    pub fn allow(mut self, fingerprint: impl Into<String>) -> Self {
        self.allowed.push(fingerprint.into());
        self
    }
}

impl HostKeyCheck for FingerprintCheck {
    fn check(&self, host_key: &[u8]) -> KestrelResult<()> {
        let actual = fingerprint(host_key);
        if self.allowed.iter().any(|fp| *fp == actual) {
            Ok(())
        } else {
            Err(KestrelError::Trust(format!(
                "host key fingerprint {} is not trusted",
                actual
            )))
        }
    }
}

/// OpenSSH style fingerprint: `SHA256:` + unpadded base64 of SHA-256(blob).
pub fn fingerprint(host_key: &[u8]) -> String {
    let hash = Sha256::digest(host_key);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

/// Encodes an `ssh-rsa` host key blob from big-endian `e` and `n`.
pub fn encode_rsa_blob(e: &[u8], n: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.string(SSH_RSA).mpint(e).mpint(n);
    enc.into_vec()
}

/// Encodes an `ssh-rsa` signature blob.
pub fn encode_signature_blob(signature: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.string(SSH_RSA).u32_bytes(signature);
    enc.into_vec()
}

/// An `ssh-rsa` server host key.
#[derive(Debug, Clone)]
pub struct RsaHostKey {
    key: RsaPublicKey,
}

impl RsaHostKey {
    /// Parses a K_S blob.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Trust`] for a key type other than `ssh-rsa` or
    /// an unusable modulus, and [`KestrelError::Protocol`] for a malformed blob.
    pub fn from_blob(blob: &[u8]) -> KestrelResult<Self> {
        let mut dec = Decoder::new(blob);
        let algorithm = dec.string()?;
        if algorithm != SSH_RSA {
            return Err(KestrelError::Trust(format!(
                "unsupported host key type: {}",
                algorithm
            )));
        }
        let e = dec.mpint()?;
        let n = dec.mpint()?;
        dec.finish()?;

        let key = RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(n),
            rsa::BigUint::from_bytes_be(e),
        )
        .map_err(|err| KestrelError::Trust(format!("invalid RSA host key: {}", err)))?;
        Ok(Self { key })
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// Verifies a signature blob over SHA-1 of the exchange hash.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Trust`] if the signature algorithm is not
    /// `ssh-rsa` or the signature does not verify.
    pub fn verify(&self, exchange_hash: &[u8], signature_blob: &[u8]) -> KestrelResult<()> {
        let mut dec = Decoder::new(signature_blob);
        let algorithm = dec.string()?;
        if algorithm != SSH_RSA {
            return Err(KestrelError::Trust(format!(
                "unsupported signature algorithm: {}",
                algorithm
            )));
        }
        let signature = dec.u32_bytes()?;
        dec.finish()?;

        // Some signers drop leading zero bytes of the signature
        let size = self.key.size();
        if signature.len() > size {
            return Err(KestrelError::Trust(
                "host key signature longer than modulus".to_string(),
            ));
        }
        let mut padded = vec![0u8; size - signature.len()];
        padded.extend_from_slice(signature);

        let digest = Sha1::digest(exchange_hash);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &padded)
            .map_err(|_| KestrelError::Trust("host key signature verification failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::RsaPrivateKey;

    const HOST_KEY_PEM: &str = include_str!("../../tests/fixtures/host_rsa.pem");

    fn host_key() -> (RsaPrivateKey, Vec<u8>) {
        let private = RsaPrivateKey::from_pkcs1_pem(HOST_KEY_PEM).unwrap();
        let blob = encode_rsa_blob(&private.e().to_bytes_be(), &private.n().to_bytes_be());
        (private, blob)
    }

    fn sign(private: &RsaPrivateKey, hash: &[u8]) -> Vec<u8> {
        let digest = Sha1::digest(hash);
        encode_signature_blob(&private.sign(Pkcs1v15Sign::new::<Sha1>(), &digest).unwrap())
    }

    #[test]
    fn test_parse_blob() {
        let (_, blob) = host_key();
        let key = RsaHostKey::from_blob(&blob).unwrap();
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn test_parse_rejects_other_types() {
        let mut enc = Encoder::new();
        enc.string("ssh-ed25519").u32_bytes(&[0u8; 32]);
        assert!(matches!(
            RsaHostKey::from_blob(enc.as_ref()),
            Err(KestrelError::Trust(_))
        ));
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let (_, mut blob) = host_key();
        blob.push(0);
        assert!(matches!(
            RsaHostKey::from_blob(&blob),
            Err(KestrelError::Protocol(_))
        ));
    }

    #[test]
    fn test_verify_signature() {
        let (private, blob) = host_key();
        let key = RsaHostKey::from_blob(&blob).unwrap();
        let h = [0x5cu8; 20];

        let signature = sign(&private, &h);
        assert!(key.verify(&h, &signature).is_ok());

        // Signature over a different hash
        assert!(matches!(
            key.verify(&[0x5d; 20], &signature),
            Err(KestrelError::Trust(_))
        ));

        // Corrupted signature
        let mut bad = signature.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(matches!(key.verify(&h, &bad), Err(KestrelError::Trust(_))));
    }

    #[test]
    fn test_verify_rejects_other_signature_algorithm() {
        let (_, blob) = host_key();
        let key = RsaHostKey::from_blob(&blob).unwrap();
        let mut enc = Encoder::new();
        enc.string("rsa-sha2-256").u32_bytes(&[0u8; 256]);
        match key.verify(&[0; 20], enc.as_ref()) {
            Err(KestrelError::Trust(msg)) => assert!(msg.contains("rsa-sha2-256")),
            other => panic!("expected trust error, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"");
        // SHA-256 of the empty string
        assert_eq!(fp, "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_closure_and_fingerprint_checks() {
        let reject = |_: &[u8]| -> KestrelResult<()> {
            Err(KestrelError::Trust("nope".to_string()))
        };
        assert!(reject.check(b"key").is_err());
        assert!(AcceptAnyHostKey.check(b"key").is_ok());

        let check = FingerprintCheck::new("SHA256:other").allow(fingerprint(b"key"));
        assert!(check.check(b"key").is_ok());
        assert!(matches!(check.check(b"yek"), Err(KestrelError::Trust(_))));
    }
}
