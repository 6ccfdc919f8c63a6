//! SSH algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT encoding and parsing
//! - Local algorithm [`Preferences`]
//! - Negotiation of the eight algorithm lists into a [`KexResult`]
//! - The handshake [`KexState`] machine
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Each list is negotiated (first client entry the server also lists)
//! 3. Diffie-Hellman exchange and host-key verification
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Both directions switch to the derived keys
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::{negotiate, KexInit, Preferences};
//!
//! let client = KexInit::new(&Preferences::default());
//! let server = KexInit::new(&Preferences::default());
//!
//! let result = negotiate(&client, &server).unwrap();
//! assert_eq!(result.kex, "diffie-hellman-group14-sha1");
//! assert!(result.guessed);
//! ```

use crate::ssh::codec::{Decoder, Encoder};
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::kex_dh::DhGroup;
use crate::ssh::message::MessageType;
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;

/// Host-key algorithms the client can verify.
pub const SUPPORTED_HOST_KEYS: &[&str] = &["ssh-rsa"];

/// Compression algorithms the client can run.
pub const SUPPORTED_COMPRESSION: &[&str] = &["none"];

/// Ordered algorithm preferences sent in our KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    /// Key exchange methods.
    pub kex: Vec<String>,
    /// Server host-key algorithms.
    pub host_key: Vec<String>,
    /// Ciphers, used for both directions.
    pub ciphers: Vec<String>,
    /// MACs, used for both directions.
    pub macs: Vec<String>,
    /// Compression, used for both directions.
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            kex: names(&["diffie-hellman-group14-sha1", "diffie-hellman-group1-sha1"]),
            host_key: names(SUPPORTED_HOST_KEYS),
            ciphers: CipherAlgorithm::ALL
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            macs: vec![MacAlgorithm::HmacSha1.name().to_string()],
            compression: names(SUPPORTED_COMPRESSION),
        }
    }
}

impl Preferences {
    /// Checks that every list is non-empty and only names implemented algorithms.
    pub fn validate(&self) -> KestrelResult<()> {
        fn check(
            what: &str,
            list: &[String],
            supported: impl Fn(&str) -> bool,
        ) -> KestrelResult<()> {
            if list.is_empty() {
                return Err(KestrelError::Config(format!("{} list is empty", what)));
            }
            match list.iter().find(|name| !supported(name)) {
                Some(name) => Err(KestrelError::Config(format!(
                    "unsupported {} algorithm: {}",
                    what, name
                ))),
                None => Ok(()),
            }
        }

        check("kex", &self.kex, |n| DhGroup::from_name(n).is_some())?;
        check("host key", &self.host_key, |n| SUPPORTED_HOST_KEYS.contains(&n))?;
        check("cipher", &self.ciphers, |n| CipherAlgorithm::from_name(n).is_some())?;
        check("mac", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        check("compression", &self.compression, |n| {
            SUPPORTED_COMPRESSION.contains(&n)
        })
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie
    pub cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client
    pub languages_server_to_client: Vec<String>,
    /// A guessed key exchange packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie from `prefs`.
    pub fn new(prefs: &Preferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_client_to_server: prefs.ciphers.clone(),
            encryption_server_to_client: prefs.ciphers.clone(),
            mac_client_to_server: prefs.macs.clone(),
            mac_server_to_client: prefs.macs.clone(),
            compression_client_to_server: prefs.compression.clone(),
            compression_server_to_client: prefs.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Serializes the message, code byte first.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::kex::{KexInit, Preferences};
    ///
    /// let bytes = KexInit::new(&Preferences::default()).to_bytes();
    /// assert_eq!(bytes[0], 20); // SSH_MSG_KEXINIT
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u8(MessageType::KexInit as u8)
            .raw(&self.cookie)
            .name_list(&self.kex_algorithms)
            .name_list(&self.server_host_key_algorithms)
            .name_list(&self.encryption_client_to_server)
            .name_list(&self.encryption_server_to_client)
            .name_list(&self.mac_client_to_server)
            .name_list(&self.mac_server_to_client)
            .name_list(&self.compression_client_to_server)
            .name_list(&self.compression_server_to_client)
            .name_list(&self.languages_client_to_server)
            .name_list(&self.languages_server_to_client)
            .bool(self.first_kex_packet_follows)
            .u32(0);
        enc.into_vec()
    }

    /// Parses a KEXINIT payload, code byte included.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the code is not 20 or a field is
    /// truncated.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut dec = Decoder::new(data);
        let code = dec.u8()?;
        if code != MessageType::KexInit as u8 {
            return Err(KestrelError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                code
            )));
        }

        let kex_init = Self {
            cookie: dec.array()?,
            kex_algorithms: dec.name_list()?,
            server_host_key_algorithms: dec.name_list()?,
            encryption_client_to_server: dec.name_list()?,
            encryption_server_to_client: dec.name_list()?,
            mac_client_to_server: dec.name_list()?,
            mac_server_to_client: dec.name_list()?,
            compression_client_to_server: dec.name_list()?,
            compression_server_to_client: dec.name_list()?,
            languages_client_to_server: dec.name_list()?,
            languages_server_to_client: dec.name_list()?,
            first_kex_packet_follows: dec.bool()?,
        };
        // uint32 reserved; some peers append extension data after it
        dec.u32()?;
        Ok(kex_init)
    }
}

/// The eight negotiated algorithm names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexResult {
    /// Key exchange method
    pub kex: String,
    /// Host-key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server
    pub mac_client_to_server: String,
    /// MAC server to client
    pub mac_server_to_client: String,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
    /// Every pick was the first entry of both lists.
    pub guessed: bool,
}

impl KexResult {
    /// Whether the peer's speculative key-exchange packet must be dropped.
    pub fn discard_guess(&self, server: &KexInit) -> bool {
        server.first_kex_packet_follows && !self.guessed
    }
}

/// Picks the first client algorithm that the server also supports.
///
/// # Example
///
/// ```rust
/// use kestrel_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm("cipher", &client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    what: &str,
    client_list: &[String],
    server_list: &[String],
) -> KestrelResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            KestrelError::Negotiation(format!(
                "no matching algorithm for {}: client={:?}, server={:?}",
                what, client_list, server_list
            ))
        })
}

/// Negotiates all eight lists of a KEXINIT pair.
pub fn negotiate(client: &KexInit, server: &KexInit) -> KestrelResult<KexResult> {
    let pairs: [(&str, &[String], &[String]); 8] = [
        ("kex", &client.kex_algorithms, &server.kex_algorithms),
        (
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        ),
        (
            "cipher client to server",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        ),
        (
            "cipher server to client",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        ),
        (
            "mac client to server",
            &client.mac_client_to_server,
            &server.mac_client_to_server,
        ),
        (
            "mac server to client",
            &client.mac_server_to_client,
            &server.mac_server_to_client,
        ),
        (
            "compression client to server",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        ),
        (
            "compression server to client",
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        ),
    ];

    let mut picks = Vec::with_capacity(8);
    let mut guessed = true;
    for (what, ours, theirs) in pairs {
        let pick = negotiate_algorithm(what, ours, theirs)?;
        guessed &= ours.first() == Some(&pick) && theirs.first() == Some(&pick);
        picks.push(pick);
    }

    let mut picks = picks.into_iter();
    let mut next = || picks.next().unwrap_or_default();
    Ok(KexResult {
        kex: next(),
        host_key: next(),
        cipher_client_to_server: next(),
        cipher_server_to_client: next(),
        mac_client_to_server: next(),
        mac_server_to_client: next(),
        compression_client_to_server: next(),
        compression_server_to_client: next(),
        guessed,
    })
}

/// Key exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Our KEXINIT is sent, the peer's has not arrived.
    AwaitKexInit,
    /// Both KEXINITs seen and the algorithms are chosen.
    Negotiated,
    /// KEXDH_INIT sent.
    AwaitKexdhReply,
    /// Host key accepted and signature verified.
    VerifiedHostKey,
    /// Our NEWKEYS sent.
    NewKeysSent,
    /// Waiting for the peer's NEWKEYS.
    AwaitPeerNewKeys,
    /// Both directions use the derived keys.
    KeysActive,
}

impl KexState {
    /// Moves to `next`, rejecting anything but the single forward step.
    pub fn transition(&mut self, next: KexState) -> KestrelResult<()> {
        use KexState::*;
        let valid = matches!(
            (*self, next),
            (AwaitKexInit, Negotiated)
                | (Negotiated, AwaitKexdhReply)
                | (AwaitKexdhReply, VerifiedHostKey)
                | (VerifiedHostKey, NewKeysSent)
                | (NewKeysSent, AwaitPeerNewKeys)
                | (AwaitPeerNewKeys, KeysActive)
        );
        if !valid {
            return Err(KestrelError::Protocol(format!(
                "Invalid key exchange transition: {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(names: &[&str]) -> Vec<String> {
        super::names(names)
    }

    #[test]
    fn test_kexinit_round_trip() {
        let mut original = KexInit::new(&Preferences::default());
        original.first_kex_packet_follows = true;
        original.languages_client_to_server = list(&["en"]);

        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_cookie_random() {
        let a = KexInit::new(&Preferences::default());
        let b = KexInit::new(&Preferences::default());
        assert_ne!(a.cookie, b.cookie);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut bytes = KexInit::new(&Preferences::default()).to_bytes();
        bytes[0] = 21;
        assert!(matches!(
            KexInit::from_bytes(&bytes),
            Err(KestrelError::Protocol(_))
        ));
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let bytes = KexInit::new(&Preferences::default()).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(KexInit::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_negotiate_algorithm_client_order_wins() {
        let client = list(&["a", "b", "c"]);
        let server = list(&["c", "b"]);
        assert_eq!(negotiate_algorithm("x", &client, &server).unwrap(), "b");

        // Swapping the client's order changes the pick
        let client = list(&["c", "b", "a"]);
        assert_eq!(negotiate_algorithm("x", &client, &server).unwrap(), "c");
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let result = negotiate_algorithm("cipher", &list(&["a"]), &list(&["b"]));
        match result {
            Err(KestrelError::Negotiation(msg)) => assert!(msg.contains("no matching algorithm")),
            other => panic!("expected negotiation error, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_guess() {
        let client = KexInit::new(&Preferences::default());
        let mut server = KexInit::new(&Preferences::default());
        let result = negotiate(&client, &server).unwrap();
        assert!(result.guessed);
        assert!(!result.discard_guess(&server));

        // Server prefers a different cipher first: still negotiable, no longer guessed
        server.encryption_server_to_client = list(&["aes256-ctr", "aes128-ctr"]);
        server.first_kex_packet_follows = true;
        let result = negotiate(&client, &server).unwrap();
        assert_eq!(result.cipher_server_to_client, "aes128-ctr");
        assert_eq!(result.cipher_client_to_server, "aes128-ctr");
        assert!(!result.guessed);
        assert!(result.discard_guess(&server));
    }

    #[test]
    fn test_negotiate_fails_on_any_list() {
        let client = KexInit::new(&Preferences::default());
        let mut server = KexInit::new(&Preferences::default());
        server.mac_server_to_client = list(&["hmac-sha2-256"]);
        assert!(matches!(
            negotiate(&client, &server),
            Err(KestrelError::Negotiation(_))
        ));
    }

    #[test]
    fn test_negotiate_is_deterministic() {
        let client = KexInit::new(&Preferences::default());
        let mut server = KexInit::new(&Preferences::default());
        server.kex_algorithms = list(&["diffie-hellman-group1-sha1", "diffie-hellman-group14-sha1"]);
        let first = negotiate(&client, &server).unwrap();
        for _ in 0..10 {
            assert_eq!(negotiate(&client, &server).unwrap(), first);
        }
        assert_eq!(first.kex, "diffie-hellman-group14-sha1");
    }

    #[test]
    fn test_preferences_validate() {
        assert!(Preferences::default().validate().is_ok());

        let mut prefs = Preferences::default();
        prefs.ciphers.push("aes128-gcm@openssh.com".to_string());
        assert!(matches!(prefs.validate(), Err(KestrelError::Config(_))));

        let mut prefs = Preferences::default();
        prefs.macs.clear();
        assert!(matches!(prefs.validate(), Err(KestrelError::Config(_))));
    }

    #[test]
    fn test_kex_state_transitions() {
        let mut state = KexState::AwaitKexInit;
        for next in [
            KexState::Negotiated,
            KexState::AwaitKexdhReply,
            KexState::VerifiedHostKey,
            KexState::NewKeysSent,
            KexState::AwaitPeerNewKeys,
            KexState::KeysActive,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, KexState::KeysActive);

        let mut state = KexState::Negotiated;
        assert!(state.transition(KexState::KeysActive).is_err());
        assert_eq!(state, KexState::Negotiated);
    }
}
