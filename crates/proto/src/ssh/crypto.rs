//! SSH packet ciphers and MACs.
//!
//! This module implements the cipher and MAC strategies used by the packet
//! layer:
//! - AES-128-CTR, AES-256-CTR
//! - AES-128-CBC, AES-256-CBC
//! - HMAC-SHA1
//!
//! Before the first NEWKEYS both directions use [`NullCipher`] and
//! [`NullMac`]. They satisfy the same traits as the real algorithms, so
//! framing code does not branch on the encryption phase.
//!
//! # Security
//!
//! - MAC comparison is constant-time ([`subtle`])
//! - MAC keys are zeroized on drop
//! - Cipher state is stateful across packets, as RFC 4253 requires for both
//!   CTR and CBC
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::crypto::{new_cipher, CipherAlgorithm, Direction};
//!
//! let key = [7u8; 16];
//! let iv = [9u8; 16];
//! let mut enc = new_cipher(CipherAlgorithm::Aes128Ctr, Direction::Encrypt, &key, &iv).unwrap();
//! let mut dec = new_cipher(CipherAlgorithm::Aes128Ctr, Direction::Decrypt, &key, &iv).unwrap();
//!
//! let mut block = *b"sixteen byte blk";
//! enc.apply(&mut block).unwrap();
//! dec.apply(&mut block).unwrap();
//! assert_eq!(&block, b"sixteen byte blk");
//! ```

use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use kestrel_platform::{KestrelError, KestrelResult};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes.
const AES_BLOCK: usize = 16;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode
    Aes128Ctr,
    /// AES-256 in counter mode
    Aes256Ctr,
    /// AES-128 in cipher block chaining mode
    Aes128Cbc,
    /// AES-256 in cipher block chaining mode
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Every supported cipher, in default preference order.
    pub const ALL: [CipherAlgorithm; 4] = [
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes128Cbc,
        CipherAlgorithm::Aes256Cbc,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        AES_BLOCK
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        AES_BLOCK
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            _ => None,
        }
    }
}

/// Whether a cipher instance encrypts or decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound packets
    Encrypt,
    /// Inbound packets
    Decrypt,
}

/// In-place packet cipher.
///
/// Implementations keep their chaining or counter state between calls, so
/// each instance must see every packet of its direction exactly once.
pub trait PacketCipher: Send {
    /// Algorithm name, or `none`.
    fn name(&self) -> &'static str;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place.
    ///
    /// `data.len()` must be a multiple of [`block_size`](Self::block_size).
    fn apply(&mut self, data: &mut [u8]) -> KestrelResult<()>;
}

/// Identity cipher used before the first key exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl PacketCipher for NullCipher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, _data: &mut [u8]) -> KestrelResult<()> {
        Ok(())
    }
}

enum CtrState {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

/// AES in counter mode. Encryption and decryption are the same operation.
pub struct CtrCipher {
    algorithm: CipherAlgorithm,
    state: CtrState,
}

impl PacketCipher for CtrCipher {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn apply(&mut self, data: &mut [u8]) -> KestrelResult<()> {
        match &mut self.state {
            CtrState::Aes128(c) => c.apply_keystream(data),
            CtrState::Aes256(c) => c.apply_keystream(data),
        }
        Ok(())
    }
}

enum CbcState {
    Enc128(Aes128CbcEnc),
    Enc256(Aes256CbcEnc),
    Dec128(Aes128CbcDec),
    Dec256(Aes256CbcDec),
}

/// AES in CBC mode, one instance per direction.
pub struct CbcCipher {
    algorithm: CipherAlgorithm,
    state: CbcState,
}

impl PacketCipher for CbcCipher {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn apply(&mut self, data: &mut [u8]) -> KestrelResult<()> {
        if data.len() % AES_BLOCK != 0 {
            return Err(KestrelError::Protocol(format!(
                "CBC input of {} bytes is not block aligned",
                data.len()
            )));
        }
        for chunk in data.chunks_exact_mut(AES_BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            match &mut self.state {
                CbcState::Enc128(c) => c.encrypt_block_mut(block),
                CbcState::Enc256(c) => c.encrypt_block_mut(block),
                CbcState::Dec128(c) => c.decrypt_block_mut(block),
                CbcState::Dec256(c) => c.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for dyn PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("algorithm", &self.name())
            .field("state", &"<redacted>")
            .finish()
    }
}

fn key_error(what: &str, algorithm: CipherAlgorithm) -> KestrelError {
    KestrelError::Protocol(format!("Invalid {} length for {}", what, algorithm.name()))
}

/// Builds a cipher from derived key material.
///
/// `key` and `iv` may be longer than needed; only the leading bytes are used.
pub fn new_cipher(
    algorithm: CipherAlgorithm,
    direction: Direction,
    key: &[u8],
    iv: &[u8],
) -> KestrelResult<Box<dyn PacketCipher>> {
    if key.len() < algorithm.key_size() {
        return Err(key_error("key", algorithm));
    }
    if iv.len() < algorithm.iv_size() {
        return Err(key_error("IV", algorithm));
    }
    let key = &key[..algorithm.key_size()];
    let iv = &iv[..algorithm.iv_size()];

    let cipher: Box<dyn PacketCipher> = match algorithm {
        CipherAlgorithm::Aes128Ctr => Box::new(CtrCipher {
            algorithm,
            state: CtrState::Aes128(
                Aes128Ctr::new_from_slices(key, iv).map_err(|_| key_error("key", algorithm))?,
            ),
        }),
        CipherAlgorithm::Aes256Ctr => Box::new(CtrCipher {
            algorithm,
            state: CtrState::Aes256(
                Aes256Ctr::new_from_slices(key, iv).map_err(|_| key_error("key", algorithm))?,
            ),
        }),
        CipherAlgorithm::Aes128Cbc => {
            let state = match direction {
                Direction::Encrypt => CbcState::Enc128(
                    Aes128CbcEnc::new_from_slices(key, iv)
                        .map_err(|_| key_error("key", algorithm))?,
                ),
                Direction::Decrypt => CbcState::Dec128(
                    Aes128CbcDec::new_from_slices(key, iv)
                        .map_err(|_| key_error("key", algorithm))?,
                ),
            };
            Box::new(CbcCipher { algorithm, state })
        }
        CipherAlgorithm::Aes256Cbc => {
            let state = match direction {
                Direction::Encrypt => CbcState::Enc256(
                    Aes256CbcEnc::new_from_slices(key, iv)
                        .map_err(|_| key_error("key", algorithm))?,
                ),
                Direction::Decrypt => CbcState::Dec256(
                    Aes256CbcDec::new_from_slices(key, iv)
                        .map_err(|_| key_error("key", algorithm))?,
                ),
            };
            Box::new(CbcCipher { algorithm, state })
        }
    };
    Ok(cipher)
}

/// Packet MAC over `sequence_number || packet`.
pub trait PacketMac: Send {
    /// Algorithm name, or `none`.
    fn name(&self) -> &'static str;

    /// MAC length in bytes.
    fn size(&self) -> usize;

    /// Computes the MAC for one packet.
    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8>;

    /// Recomputes the MAC and compares it to `received` in constant time.
    fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> KestrelResult<()> {
        let computed = self.compute(sequence, packet);
        if computed.len() != received.len() {
            return Err(KestrelError::InvalidMac);
        }
        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(KestrelError::InvalidMac)
        }
    }
}

/// Zero-length MAC used before the first key exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMac;

impl PacketMac for NullMac {
    fn name(&self) -> &'static str {
        "none"
    }

    fn size(&self) -> usize {
        0
    }

    fn compute(&self, _sequence: u32, _packet: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

/// HMAC-SHA1 packet MAC.
pub struct HmacSha1Mac {
    key: Vec<u8>,
    keyed: Hmac<Sha1>,
}

impl HmacSha1Mac {
    /// Creates a MAC from derived key material (first 20 bytes are used).
    pub fn new(key_material: &[u8]) -> KestrelResult<Self> {
        let size = MacAlgorithm::HmacSha1.key_size();
        if key_material.len() < size {
            return Err(KestrelError::Protocol(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                size,
                key_material.len()
            )));
        }
        let key = key_material[..size].to_vec();
        let keyed = Hmac::<Sha1>::new_from_slice(&key)
            .map_err(|_| KestrelError::Protocol("Invalid HMAC key".to_string()))?;
        Ok(Self { key, keyed })
    }
}

impl PacketMac for HmacSha1Mac {
    fn name(&self) -> &'static str {
        MacAlgorithm::HmacSha1.name()
    }

    fn size(&self) -> usize {
        MacAlgorithm::HmacSha1.mac_size()
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        let mut mac = self.keyed.clone();
        mac.update(&sequence.to_be_bytes());
        mac.update(packet);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for HmacSha1Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha1Mac")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for HmacSha1Mac {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Builds a MAC from derived key material.
pub fn new_mac(algorithm: MacAlgorithm, key: &[u8]) -> KestrelResult<Box<dyn PacketMac>> {
    match algorithm {
        MacAlgorithm::HmacSha1 => Ok(Box::new(HmacSha1Mac::new(key)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_algorithm_properties() {
        assert_eq!(CipherAlgorithm::Aes128Ctr.key_size(), 16);
        assert_eq!(CipherAlgorithm::Aes256Cbc.key_size(), 32);
        assert_eq!(CipherAlgorithm::Aes256Ctr.iv_size(), 16);
        assert_eq!(CipherAlgorithm::Aes128Cbc.block_size(), 16);
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes256-ctr"),
            Some(CipherAlgorithm::Aes256Ctr)
        );
        assert_eq!(
            CipherAlgorithm::from_name("aes128-cbc"),
            Some(CipherAlgorithm::Aes128Cbc)
        );
        assert!(CipherAlgorithm::from_name("chacha20-poly1305@openssh.com").is_none());
        assert_eq!(MacAlgorithm::from_name("hmac-sha1"), Some(MacAlgorithm::HmacSha1));
        assert!(MacAlgorithm::from_name("hmac-sha2-256").is_none());
    }

    #[test]
    fn test_ctr_matches_nist_vector() {
        // NIST SP 800-38A F.5.1 CTR-AES128.Encrypt, first block
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let mut block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let mut enc = new_cipher(CipherAlgorithm::Aes128Ctr, Direction::Encrypt, &key, &iv).unwrap();
        enc.apply(&mut block).unwrap();
        assert_eq!(hex::encode(&block), "874d6191b620e3261bef6864990db6ce");
    }

    #[test]
    fn test_cbc_matches_nist_vector() {
        // NIST SP 800-38A F.2.1 CBC-AES128.Encrypt, first two blocks
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain = hex::decode(
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51",
        )
        .unwrap();

        // Two separate calls must chain exactly like one call
        let mut data = plain.clone();
        let mut enc = new_cipher(CipherAlgorithm::Aes128Cbc, Direction::Encrypt, &key, &iv).unwrap();
        enc.apply(&mut data[..16]).unwrap();
        enc.apply(&mut data[16..]).unwrap();
        assert_eq!(
            hex::encode(&data),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );

        let mut dec = new_cipher(CipherAlgorithm::Aes128Cbc, Direction::Decrypt, &key, &iv).unwrap();
        dec.apply(&mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let mut enc =
            new_cipher(CipherAlgorithm::Aes256Cbc, Direction::Encrypt, &[1u8; 32], &[2u8; 16])
                .unwrap();
        let mut data = vec![0u8; 20];
        assert!(matches!(enc.apply(&mut data), Err(KestrelError::Protocol(_))));
    }

    #[test]
    fn test_cipher_insufficient_key() {
        let result = new_cipher(CipherAlgorithm::Aes256Ctr, Direction::Encrypt, &[0u8; 20], &[0u8; 16]);
        assert!(result.is_err());
    }

    #[test]
    fn test_hmac_sha1_known_answer() {
        // RFC 2202 test case 2. The sequence number supplies the first four
        // bytes of the data, and HMAC zero-pads short keys, so "Jefe" padded
        // to 20 bytes is the same key.
        let mac = HmacSha1Mac::new(b"Jefe\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0").unwrap();
        let seq = u32::from_be_bytes(*b"what");
        let tag = mac.compute(seq, b" do ya want for nothing?");
        assert_eq!(hex::encode(&tag), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn test_mac_verify() {
        let mac = HmacSha1Mac::new(&[0x11; 20]).unwrap();
        let tag = mac.compute(3, b"packet");
        assert_eq!(tag.len(), 20);
        assert!(mac.verify(3, b"packet", &tag).is_ok());
        assert!(matches!(mac.verify(4, b"packet", &tag), Err(KestrelError::InvalidMac)));
        assert!(matches!(mac.verify(3, b"packet", &tag[..19]), Err(KestrelError::InvalidMac)));
    }

    #[test]
    fn test_null_strategies() {
        let mut cipher = NullCipher;
        let mut data = *b"plain";
        cipher.apply(&mut data).unwrap();
        assert_eq!(&data, b"plain");

        let mac = NullMac;
        assert_eq!(mac.size(), 0);
        assert!(mac.verify(0, b"anything", &[]).is_ok());
    }
}
