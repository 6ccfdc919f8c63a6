//! Diffie-Hellman key exchange with SHA-1 (RFC 4253 Section 8).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (RFC 2409 Oakley group 2, 1024-bit)
//! - diffie-hellman-group14-sha1 (RFC 3526 group 14, 2048-bit)
//! - The exchange hash H
//! - Session key derivation (RFC 4253 Section 7.2)
//!
//! # Security
//!
//! - Peer public values outside `1 < f < p-1` are rejected
//! - Private exponents and derived keys are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex_dh::{DhExchange, DhGroup};
//!
//! let client = DhExchange::new(DhGroup::Group14);
//! let server = DhExchange::new(DhGroup::Group14);
//!
//! let k1 = client.shared_secret(&server.public_value()).unwrap();
//! let k2 = server.shared_secret(&client.public_value()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::codec::Encoder;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

const OAKLEY_GROUP2_HEX: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
    FFFFFFFFFFFFFFFF";

const MODP_GROUP14_HEX: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
    DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
    15728E5A8AACAA68FFFFFFFFFFFFFFFF";

// Both constants are fixed hex; the group tests check their bit lengths.
static GROUP1_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(OAKLEY_GROUP2_HEX.as_bytes(), 16).unwrap_or_default());
static GROUP14_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(MODP_GROUP14_HEX.as_bytes(), 16).unwrap_or_default());

/// Fixed safe-prime group, selected by kex method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// diffie-hellman-group1-sha1
    Group1,
    /// diffie-hellman-group14-sha1
    Group14,
}

impl DhGroup {
    /// Returns the kex method name.
    pub fn name(&self) -> &'static str {
        match self {
            DhGroup::Group1 => "diffie-hellman-group1-sha1",
            DhGroup::Group14 => "diffie-hellman-group14-sha1",
        }
    }

    /// Looks up a group by kex method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(DhGroup::Group1),
            "diffie-hellman-group14-sha1" => Some(DhGroup::Group14),
            _ => None,
        }
    }

    /// The group prime p.
    pub fn prime(&self) -> &'static BigUint {
        match self {
            DhGroup::Group1 => &GROUP1_P,
            DhGroup::Group14 => &GROUP14_P,
        }
    }

    /// The generator g (2 for both groups).
    pub fn generator(&self) -> BigUint {
        BigUint::from(2u32)
    }
}

/// One side's ephemeral Diffie-Hellman state.
pub struct DhExchange {
    group: DhGroup,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates a private exponent `2 <= x < p-1` and `e = g^x mod p`.
    pub fn new(group: DhGroup) -> Self {
        let p = group.prime();
        let p_minus_one = p - 1u32;
        let x = rand::thread_rng().gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let e = group.generator().modpow(&x, p);
        Self {
            group,
            private_key: x.to_bytes_be(),
            public_key: e.to_bytes_be(),
        }
    }

    /// The group in use.
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Our public value, big-endian magnitude.
    pub fn public_value(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    /// Computes `K = f^x mod p` from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] unless `1 < f < p-1`.
    pub fn shared_secret(&self, peer_public: &[u8]) -> KestrelResult<Vec<u8>> {
        let p = self.group.prime();
        let f = BigUint::from_bytes_be(peer_public);
        let p_minus_one = p - 1u32;
        if f <= BigUint::from(1u32) || f >= p_minus_one {
            return Err(KestrelError::Protocol(
                "Invalid DH public value: out of range".to_string(),
            ));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(f.modpow(&x, p).to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Inputs of the exchange hash, in hashing order.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, our identification line without CR LF
    pub client_ident: &'a str,
    /// V_S, the server's identification line without CR LF
    pub server_ident: &'a str,
    /// I_C, our KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, the host-key blob
    pub host_key: &'a [u8],
    /// e
    pub client_public: &'a [u8],
    /// f
    pub server_public: &'a [u8],
    /// K
    pub shared_secret: &'a [u8],
}

/// Computes `H = SHA1(string V_C || string V_S || string I_C || string I_S ||
/// string K_S || mpint e || mpint f || mpint K)`.
pub fn exchange_hash(input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.string(input.client_ident)
        .string(input.server_ident)
        .u32_bytes(input.client_kexinit)
        .u32_bytes(input.server_kexinit)
        .u32_bytes(input.host_key)
        .mpint(input.client_public)
        .mpint(input.server_public)
        .mpint(input.shared_secret);
    Sha1::digest(enc.as_ref()).to_vec()
}

/// Derives one session secret (RFC 4253 Section 7.2).
///
/// `K1 = SHA1(mpint K || H || letter || session_id)`, extended with
/// `SHA1(mpint K || H || K1 || K2 ...)` until `len` bytes are available.
///
/// ```rust
/// use kestrel_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 20], &[0x02; 20], b'C', 32);
/// assert_eq!(key.len(), 32);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    len: usize,
) -> Vec<u8> {
    let mut k = Encoder::new();
    k.mpint(shared_secret);

    let mut hasher = Sha1::new();
    hasher.update(k.as_ref());
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    let mut key = hasher.finalize_reset().to_vec();

    while key.len() < len {
        hasher.update(k.as_ref());
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize_reset();
        key.extend_from_slice(&block);
    }

    key.truncate(len);
    key
}

/// The six secrets of one key exchange, sized for the negotiated algorithms.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// 'A': IV client to server
    pub iv_client_to_server: Vec<u8>,
    /// 'B': IV server to client
    pub iv_server_to_client: Vec<u8>,
    /// 'C': encryption key client to server
    pub key_client_to_server: Vec<u8>,
    /// 'D': encryption key server to client
    pub key_server_to_client: Vec<u8>,
    /// 'E': MAC key client to server
    pub mac_client_to_server: Vec<u8>,
    /// 'F': MAC key server to client
    pub mac_server_to_client: Vec<u8>,
}

impl SessionKeys {
    /// Derives all six secrets.
    pub fn derive(
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        cipher_client_to_server: CipherAlgorithm,
        cipher_server_to_client: CipherAlgorithm,
        mac_client_to_server: MacAlgorithm,
        mac_server_to_client: MacAlgorithm,
    ) -> Self {
        let derive = |letter: u8, len: usize| {
            derive_key(shared_secret, exchange_hash, session_id, letter, len)
        };
        Self {
            iv_client_to_server: derive(b'A', cipher_client_to_server.iv_size()),
            iv_server_to_client: derive(b'B', cipher_server_to_client.iv_size()),
            key_client_to_server: derive(b'C', cipher_client_to_server.key_size()),
            key_server_to_client: derive(b'D', cipher_server_to_client.key_size()),
            mac_client_to_server: derive(b'E', mac_client_to_server.key_size()),
            mac_server_to_client: derive(b'F', mac_server_to_client.key_size()),
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
