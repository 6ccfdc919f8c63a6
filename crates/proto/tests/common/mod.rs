//! Scripted SSH server for the integration tests.
//!
//! Built from the crate's own wire primitives: it runs the identification
//! exchange, a real DH key exchange signed with the fixture RSA key and
//! password authentication, then hands the encrypted packet halves to the
//! test, which plays the connection protocol by hand.

#![allow(dead_code)]

use kestrel_platform::{KestrelError, KestrelResult, NullLogger};
use kestrel_proto::ssh::codec::Decoder;
use kestrel_proto::ssh::crypto::{new_cipher, new_mac, CipherAlgorithm, Direction, MacAlgorithm};
use kestrel_proto::ssh::hostkey::{encode_rsa_blob, encode_signature_blob, fingerprint};
use kestrel_proto::ssh::kex::{negotiate, KexInit, KexResult, Preferences};
use kestrel_proto::ssh::kex_dh::{exchange_hash, DhExchange, DhGroup, ExchangeHashInput, SessionKeys};
use kestrel_proto::ssh::message::MessageType;
use kestrel_proto::ssh::packet::PacketBuilder;
use kestrel_proto::ssh::transport::{PacketReader, PacketWriter};
use kestrel_proto::ssh::version::{self, Version};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};

const HOST_KEY_PEM: &str = include_str!("../fixtures/host_rsa.pem");

/// Loads the fixture host key.
pub fn host_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(HOST_KEY_PEM).expect("fixture key parses")
}

/// K_S blob of the fixture host key.
pub fn host_key_blob() -> Vec<u8> {
    let key = host_key();
    encode_rsa_blob(&key.e().to_bytes_be(), &key.n().to_bytes_be())
}

/// Fingerprint of the fixture host key.
pub fn host_key_fingerprint() -> String {
    fingerprint(&host_key_blob())
}

/// What the mock server offers and accepts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Lists the server's KEXINIT offers.
    pub preferences: Preferences,
    pub password: String,
    pub banner: Option<String>,
    /// Sets `first_kex_packet_follows` and sends a KEXDH_INIT right after
    /// KEXINIT. DH has no server-side first packet, so a client must always
    /// treat it as a wrong guess.
    pub wrong_guess: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            preferences: Preferences::default(),
            password: "secret".to_string(),
            banner: None,
            wrong_guess: false,
        }
    }
}

/// The server after authentication.
pub struct MockServer<S> {
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    /// Client identification line.
    pub client_ident: String,
    /// Password attempts made before success.
    pub attempts: u32,
    /// Bytes the client granted through WINDOW_ADJUST, per `expect` call.
    pub granted: u32,
    /// Algorithms agreed during key exchange.
    pub negotiated: Option<KexResult>,
}

fn protocol(msg: impl Into<String>) -> KestrelError {
    KestrelError::Protocol(msg.into())
}

impl<S: AsyncRead + AsyncWrite + Unpin> MockServer<S> {
    /// Runs the setup phases on `stream`.
    pub async fn accept(stream: S, options: &ServerOptions) -> KestrelResult<Self> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);
        let local = Version::new("OpenSSH_x", None);
        let client_ident =
            version::exchange(&mut buffered, &mut write_half, &local, &NullLogger).await?;

        let mut server = Self {
            reader: PacketReader::new(buffered),
            writer: PacketWriter::new(write_half),
            client_ident,
            attempts: 0,
            granted: 0,
            negotiated: None,
        };
        server.negotiated = Some(server.key_exchange(&local.to_string(), options).await?);
        server.authenticate(options).await?;
        Ok(server)
    }

    async fn key_exchange(
        &mut self,
        server_ident: &str,
        options: &ServerOptions,
    ) -> KestrelResult<KexResult> {
        let client_kexinit = self.expect(MessageType::KexInit).await?;
        let client_init = KexInit::from_bytes(&client_kexinit)?;
        let mut server_init = KexInit::new(&options.preferences);
        server_init.first_kex_packet_follows = options.wrong_guess;
        let server_kexinit = server_init.to_bytes();
        self.send(PacketBuilder::from_payload(&server_kexinit)).await?;
        if options.wrong_guess {
            let mut guess = PacketBuilder::new(MessageType::KexdhInit);
            guess.mpint(&[0x02]);
            self.send(guess).await?;
        }

        let result = negotiate(&client_init, &server_init)?;
        let group = DhGroup::from_name(&result.kex).ok_or_else(|| protocol("kex"))?;

        let init = self.expect(MessageType::KexdhInit).await?;
        let mut dec = Decoder::new(&init);
        dec.u8()?;
        let e = dec.mpint()?.to_vec();

        let dh = DhExchange::new(group);
        let f = dh.public_value();
        let k = dh.shared_secret(&e)?;
        let host_key_blob = host_key_blob();
        let h = exchange_hash(&ExchangeHashInput {
            client_ident: &self.client_ident,
            server_ident,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key: &host_key_blob,
            client_public: &e,
            server_public: &f,
            shared_secret: &k,
        });
        let signature = host_key()
            .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(&h))
            .map_err(|err| protocol(err.to_string()))?;

        let mut reply = PacketBuilder::new(MessageType::KexdhReply);
        reply
            .u32_bytes(&host_key_blob)
            .mpint(&f)
            .u32_bytes(&encode_signature_blob(&signature));
        self.send(reply).await?;
        self.send(PacketBuilder::new(MessageType::NewKeys)).await?;
        self.expect(MessageType::NewKeys).await?;

        let cipher = |name: &str| CipherAlgorithm::from_name(name).ok_or_else(|| protocol("cipher"));
        let mac = |name: &str| MacAlgorithm::from_name(name).ok_or_else(|| protocol("mac"));
        let c2s = cipher(&result.cipher_client_to_server)?;
        let s2c = cipher(&result.cipher_server_to_client)?;
        let mac_c2s = mac(&result.mac_client_to_server)?;
        let mac_s2c = mac(&result.mac_server_to_client)?;
        let keys = SessionKeys::derive(&k, &h, &h, c2s, s2c, mac_c2s, mac_s2c);

        self.reader.install(
            new_cipher(c2s, Direction::Decrypt, &keys.key_client_to_server, &keys.iv_client_to_server)?,
            new_mac(mac_c2s, &keys.mac_client_to_server)?,
        );
        self.writer.install(
            new_cipher(s2c, Direction::Encrypt, &keys.key_server_to_client, &keys.iv_server_to_client)?,
            new_mac(mac_s2c, &keys.mac_server_to_client)?,
        );
        Ok(result)
    }

    async fn authenticate(&mut self, options: &ServerOptions) -> KestrelResult<()> {
        let request = self.expect(MessageType::ServiceRequest).await?;
        let mut dec = Decoder::new(&request);
        dec.u8()?;
        let service = dec.string()?.to_string();
        let mut accept = PacketBuilder::new(MessageType::ServiceAccept);
        accept.string(&service);
        self.send(accept).await?;

        loop {
            let request = self.expect(MessageType::UserauthRequest).await?;
            let mut dec = Decoder::new(&request);
            dec.u8()?;
            let _user = dec.string()?;
            let _service = dec.string()?;
            let method = dec.string()?;
            if method != "password" {
                return Err(protocol(format!("unexpected method {}", method)));
            }
            dec.bool()?;
            let password = dec.string()?;
            self.attempts += 1;

            if password == options.password {
                if let Some(banner) = &options.banner {
                    let mut packet = PacketBuilder::new(MessageType::UserauthBanner);
                    packet.string(banner).string("");
                    self.send(packet).await?;
                }
                return self.send(PacketBuilder::new(MessageType::UserauthSuccess)).await;
            }
            let mut failure = PacketBuilder::new(MessageType::UserauthFailure);
            failure.name_list(&["password"]).bool(false);
            self.send(failure).await?;
        }
    }

    /// Sends one packet.
    pub async fn send(&mut self, packet: PacketBuilder) -> KestrelResult<()> {
        self.writer.write_packet(packet).await
    }

    /// Reads the next packet.
    pub async fn recv(&mut self) -> KestrelResult<Vec<u8>> {
        self.reader.read_packet().await
    }

    /// Reads the next packet and requires it to be `expected`.
    ///
    /// WINDOW_ADJUST packets in between are added to `granted`.
    pub async fn expect(&mut self, expected: MessageType) -> KestrelResult<Vec<u8>> {
        loop {
            let payload = self.recv().await?;
            let code = payload.first().copied().unwrap_or(0);
            if code == MessageType::ChannelWindowAdjust as u8
                && expected != MessageType::ChannelWindowAdjust
            {
                let mut dec = Decoder::new(&payload);
                dec.u8()?;
                dec.u32()?;
                self.granted += dec.u32()?;
                continue;
            }
            if code != expected as u8 {
                return Err(protocol(format!("expected {}, got {}", expected as u8, code)));
            }
            return Ok(payload);
        }
    }

    /// Waits for the client's DISCONNECT and returns its reason code.
    pub async fn expect_disconnect(&mut self) -> KestrelResult<u32> {
        let payload = self.expect(MessageType::Disconnect).await?;
        let mut dec = Decoder::new(&payload);
        dec.u8()?;
        dec.u32()
    }

    /// Reads a CHANNEL_OPEN and returns its type, the client's channel id
    /// and the rest of the payload.
    pub async fn expect_open(&mut self) -> KestrelResult<OpenRequest> {
        let payload = self.expect(MessageType::ChannelOpen).await?;
        let mut dec = Decoder::new(&payload);
        dec.u8()?;
        let kind = dec.string()?.to_string();
        let sender = dec.u32()?;
        let window = dec.u32()?;
        let max_packet = dec.u32()?;
        let (host, port) = if kind == "direct-tcpip" {
            let host = dec.string()?.to_string();
            let port = dec.u32()?;
            dec.string()?;
            dec.u32()?;
            (Some(host), Some(port))
        } else {
            (None, None)
        };
        Ok(OpenRequest {
            kind,
            sender,
            window,
            max_packet,
            host,
            port,
        })
    }

    /// Accepts a channel, giving it `server_id` on our side.
    pub async fn confirm(&mut self, open: &OpenRequest, server_id: u32, window: u32, max_packet: u32) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelOpenConfirmation);
        packet.u32(open.sender).u32(server_id).u32(window).u32(max_packet);
        self.send(packet).await
    }

    /// Refuses a channel.
    pub async fn refuse(&mut self, open: &OpenRequest, reason: u32, description: &str) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelOpenFailure);
        packet.u32(open.sender).u32(reason).string(description).string("");
        self.send(packet).await
    }

    /// Reads a CHANNEL_REQUEST; returns its recipient, type, want-reply
    /// flag and type-specific data.
    pub async fn expect_request(&mut self) -> KestrelResult<(u32, String, bool, Vec<u8>)> {
        let payload = self.expect(MessageType::ChannelRequest).await?;
        let mut dec = Decoder::new(&payload);
        dec.u8()?;
        let recipient = dec.u32()?;
        let name = dec.string()?.to_string();
        let want_reply = dec.bool()?;
        Ok((recipient, name, want_reply, dec.rest().to_vec()))
    }

    /// Reads a CHANNEL_DATA; returns its recipient and data.
    pub async fn expect_data(&mut self) -> KestrelResult<(u32, Vec<u8>)> {
        let payload = self.expect(MessageType::ChannelData).await?;
        let mut dec = Decoder::new(&payload);
        dec.u8()?;
        let recipient = dec.u32()?;
        Ok((recipient, dec.u32_bytes()?.to_vec()))
    }

    /// Sends a message that carries only a recipient channel.
    pub async fn send_simple(&mut self, code: MessageType, recipient: u32) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(code);
        packet.u32(recipient);
        self.send(packet).await
    }

    /// Sends CHANNEL_DATA.
    pub async fn send_data(&mut self, recipient: u32, data: &[u8]) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelData);
        packet.u32(recipient).u32_bytes(data);
        self.send(packet).await
    }

    /// Sends stderr data.
    pub async fn send_stderr(&mut self, recipient: u32, data: &[u8]) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelExtendedData);
        packet.u32(recipient).u32(1).u32_bytes(data);
        self.send(packet).await
    }

    /// Sends an exit-status request.
    pub async fn send_exit_status(&mut self, recipient: u32, status: u32) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelRequest);
        packet.u32(recipient).string("exit-status").bool(false).u32(status);
        self.send(packet).await
    }

    /// Grants `bytes` more window.
    pub async fn send_window_adjust(&mut self, recipient: u32, bytes: u32) -> KestrelResult<()> {
        let mut packet = PacketBuilder::new(MessageType::ChannelWindowAdjust);
        packet.u32(recipient).u32(bytes);
        self.send(packet).await
    }
}

/// A decoded CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub kind: String,
    pub sender: u32,
    pub window: u32,
    pub max_packet: u32,
    pub host: Option<String>,
    pub port: Option<u32>,
}
