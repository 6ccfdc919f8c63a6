//! Client side of the SSH key exchange.
//!
//! Runs on the whole [`Transport`] before the session loop starts:
//!
//! 1. Send KEXINIT, receive the server's
//! 2. Negotiate, and drop a wrongly guessed speculative packet
//! 3. Send KEXDH_INIT, receive KEXDH_REPLY
//! 4. Ask the [`HostKeyCheck`], compute K and H, verify the signature
//! 5. Send NEWKEYS, wait for the server's
//! 6. Derive the six secrets and switch both directions
//!
//! Each step advances a [`KexState`], so a message arriving out of order
//! fails the handshake instead of being misread.

use crate::ssh::codec::Decoder;
use crate::ssh::crypto::{new_cipher, new_mac, CipherAlgorithm, Direction, MacAlgorithm};
use crate::ssh::hostkey::{fingerprint, HostKeyCheck, RsaHostKey};
use crate::ssh::kex::{negotiate, KexInit, KexResult, KexState, Preferences};
use crate::ssh::kex_dh::{exchange_hash, DhExchange, DhGroup, ExchangeHashInput, SessionKeys};
use crate::ssh::message::{describe, disconnect, MessageType};
use crate::ssh::packet::PacketBuilder;
use crate::ssh::transport::Transport;
use kestrel_platform::{KestrelError, KestrelResult};
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroize;

/// Reads the next packet that is not IGNORE, DEBUG or UNIMPLEMENTED.
///
/// A DISCONNECT from the peer becomes a protocol error.
pub(crate) async fn next_message<S>(transport: &mut Transport<S>) -> KestrelResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = transport.read_packet().await?;
        let code = payload.first().copied().unwrap_or(0);
        match MessageType::from_u8(code) {
            Some(MessageType::Ignore) | Some(MessageType::Debug) | Some(MessageType::Unimplemented) => {
                transport
                    .logger()
                    .debug(format_args!("dropping {} during setup", describe(code)));
            }
            Some(MessageType::Disconnect) => return Err(peer_disconnected(&payload)),
            _ => return Ok(payload),
        }
    }
}

/// Reads the next message and requires it to be `expected`.
pub(crate) async fn expect_message<S>(
    transport: &mut Transport<S>,
    expected: MessageType,
) -> KestrelResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = next_message(transport).await?;
    let code = payload.first().copied().unwrap_or(0);
    if code != expected as u8 {
        return Err(KestrelError::Protocol(format!(
            "expected {}, got {}",
            expected,
            describe(code)
        )));
    }
    Ok(payload)
}

/// Decodes a DISCONNECT payload into its reason code and description.
pub(crate) fn parse_disconnect(payload: &[u8]) -> KestrelResult<(u32, String)> {
    let mut dec = Decoder::new(payload);
    dec.u8()?;
    let reason = dec.u32()?;
    let description = dec.string()?.to_string();
    Ok((reason, description))
}

/// Builds the error for a DISCONNECT payload.
pub(crate) fn peer_disconnected(payload: &[u8]) -> KestrelError {
    match parse_disconnect(payload) {
        Ok((reason, description)) => KestrelError::Protocol(format!(
            "peer disconnected: {} (reason {})",
            description, reason
        )),
        Err(_) => KestrelError::Protocol("peer disconnected".to_string()),
    }
}

/// Encodes a DISCONNECT message.
pub fn disconnect_message(reason: u32, description: &str) -> PacketBuilder {
    let mut packet = PacketBuilder::new(MessageType::Disconnect);
    packet.u32(reason).string(description).string("");
    packet
}

fn cipher_for(name: &str) -> KestrelResult<CipherAlgorithm> {
    CipherAlgorithm::from_name(name)
        .ok_or_else(|| KestrelError::Negotiation(format!("unsupported cipher: {}", name)))
}

fn mac_for(name: &str) -> KestrelResult<MacAlgorithm> {
    MacAlgorithm::from_name(name)
        .ok_or_else(|| KestrelError::Negotiation(format!("unsupported mac: {}", name)))
}

/// Runs the full key exchange.
///
/// On success both directions of `transport` use the derived keys and its
/// session identifier is set.
///
/// # Errors
///
/// - [`KestrelError::Negotiation`] if any algorithm list has no match
/// - [`KestrelError::Trust`] if `check` rejects the host key or the
///   signature does not verify
/// - [`KestrelError::Protocol`] / [`KestrelError::Io`] for framing failures
pub async fn run<S>(
    transport: &mut Transport<S>,
    prefs: &Preferences,
    check: &dyn HostKeyCheck,
) -> KestrelResult<KexResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = exchange(transport, prefs, check).await;
    if let Err(err) = &result {
        let reason = match err {
            KestrelError::Negotiation(_) => Some(disconnect::KEY_EXCHANGE_FAILED),
            KestrelError::Trust(_) => Some(disconnect::HOST_KEY_NOT_VERIFIABLE),
            _ => None,
        };
        if let Some(reason) = reason {
            // Best effort; the handshake error is what the caller sees
            let _ = transport
                .write_packet(disconnect_message(reason, &err.to_string()))
                .await;
        }
    }
    result
}

async fn exchange<S>(
    transport: &mut Transport<S>,
    prefs: &Preferences,
    check: &dyn HostKeyCheck,
) -> KestrelResult<KexResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let logger = transport.logger().clone();
    let mut state = KexState::AwaitKexInit;

    let client_init = KexInit::new(prefs);
    transport.write_kex_init(&client_init).await?;

    let payload = expect_message(transport, MessageType::KexInit).await?;
    let server_init = KexInit::from_bytes(&payload)?;
    transport.set_server_kexinit(payload);

    let result = negotiate(&client_init, &server_init)?;
    state.transition(KexState::Negotiated)?;
    logger.info(format_args!(
        "negotiated kex={} hostkey={} cipher={}/{} mac={}/{}",
        result.kex,
        result.host_key,
        result.cipher_client_to_server,
        result.cipher_server_to_client,
        result.mac_client_to_server,
        result.mac_server_to_client
    ));

    if result.discard_guess(&server_init) {
        let dropped = transport.read_packet().await?;
        logger.debug(format_args!(
            "discarded wrongly guessed {}",
            describe(dropped.first().copied().unwrap_or(0))
        ));
    }

    let group = DhGroup::from_name(&result.kex)
        .ok_or_else(|| KestrelError::Negotiation(format!("unsupported kex: {}", result.kex)))?;
    let cipher_c2s = cipher_for(&result.cipher_client_to_server)?;
    let cipher_s2c = cipher_for(&result.cipher_server_to_client)?;
    let mac_c2s = mac_for(&result.mac_client_to_server)?;
    let mac_s2c = mac_for(&result.mac_server_to_client)?;

    let dh = DhExchange::new(group);
    let e = dh.public_value();
    let mut init = PacketBuilder::new(MessageType::KexdhInit);
    init.mpint(&e);
    transport.write_packet(init).await?;
    state.transition(KexState::AwaitKexdhReply)?;

    let reply = expect_message(transport, MessageType::KexdhReply).await?;
    let mut dec = Decoder::new(&reply);
    dec.u8()?;
    let host_key = dec.u32_bytes()?;
    let f = dec.mpint()?;
    let signature = dec.u32_bytes()?;
    dec.finish()?;

    logger.info(format_args!("server host key {}", fingerprint(host_key)));
    check.check(host_key).map_err(|err| match err {
        KestrelError::Trust(msg) => KestrelError::Trust(msg),
        other => KestrelError::Trust(other.to_string()),
    })?;

    let mut k = dh.shared_secret(f)?;
    let h = exchange_hash(&ExchangeHashInput {
        client_ident: transport.client_ident(),
        server_ident: transport.server_ident(),
        client_kexinit: transport.client_kexinit(),
        server_kexinit: transport.server_kexinit(),
        host_key,
        client_public: &e,
        server_public: f,
        shared_secret: &k,
    });
    let session_id = transport.set_session_id(&h).to_vec();

    RsaHostKey::from_blob(host_key)?.verify(&h, signature)?;
    state.transition(KexState::VerifiedHostKey)?;

    transport
        .write_packet(PacketBuilder::new(MessageType::NewKeys))
        .await?;
    state.transition(KexState::NewKeysSent)?;
    state.transition(KexState::AwaitPeerNewKeys)?;
    expect_message(transport, MessageType::NewKeys).await?;

    let keys = SessionKeys::derive(&k, &h, &session_id, cipher_c2s, cipher_s2c, mac_c2s, mac_s2c);
    k.zeroize();
    let write = (
        new_cipher(
            cipher_c2s,
            Direction::Encrypt,
            &keys.key_client_to_server,
            &keys.iv_client_to_server,
        )?,
        new_mac(mac_c2s, &keys.mac_client_to_server)?,
    );
    let read = (
        new_cipher(
            cipher_s2c,
            Direction::Decrypt,
            &keys.key_server_to_client,
            &keys.iv_server_to_client,
        )?,
        new_mac(mac_s2c, &keys.mac_server_to_client)?,
    );
    transport.install_keys(read, write);
    state.transition(KexState::KeysActive)?;
    logger.info(format_args!("NEWKEYS exchanged, transport encrypted"));

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_disconnected_message() {
        let packet = disconnect_message(11, "bye");
        match peer_disconnected(packet.payload()) {
            KestrelError::Protocol(msg) => {
                assert!(msg.contains("peer disconnected"));
                assert!(msg.contains("bye"));
                assert!(msg.contains("11"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            peer_disconnected(&[1]),
            KestrelError::Protocol(_)
        ));
    }

    #[test]
    fn test_algorithm_lookup() {
        assert_eq!(cipher_for("aes256-cbc").unwrap(), CipherAlgorithm::Aes256Cbc);
        assert!(matches!(cipher_for("3des-cbc"), Err(KestrelError::Negotiation(_))));
        assert!(matches!(mac_for("hmac-md5"), Err(KestrelError::Negotiation(_))));
    }
}
