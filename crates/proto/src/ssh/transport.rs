//! SSH transport layer (RFC 4253).
//!
//! [`Transport`] owns the byte stream of one connection. It runs the
//! identification exchange, then frames packets through the current cipher
//! and MAC of each direction.
//!
//! The stream is split into a [`PacketReader`] and a [`PacketWriter`], each
//! holding its own cipher, MAC and sequence counter. During the handshake
//! both live inside the `Transport`. Once keys are active the session loop
//! takes them apart with [`Transport::into_split`], so the reader can run on
//! its own task.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_platform::default_logger;
//! use kestrel_proto::ssh::transport::Transport;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:22").await?;
//! let transport = Transport::connect(stream, "kestrel_0.1", default_logger()).await?;
//! println!("server: {}", transport.server_ident());
//! # Ok(())
//! # }
//! ```

use crate::ssh::crypto::{NullCipher, NullMac, PacketCipher, PacketMac};
use crate::ssh::kex::KexInit;
use crate::ssh::packet::{framing_block_size, FrameHeader, PacketBuilder};
use crate::ssh::version::{self, Version};
use kestrel_platform::{KestrelError, KestrelResult, Logger};
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

/// Inbound half: buffered reader, read cipher, read MAC, read sequence.
pub struct PacketReader<R> {
    reader: BufReader<R>,
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    sequence: u32,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Creates a reader in the unencrypted phase.
    pub fn new(reader: BufReader<R>) -> Self {
        Self {
            reader,
            cipher: Box::new(NullCipher),
            mac: Box::new(NullMac),
            sequence: 0,
        }
    }

    /// Sequence number of the next packet to read.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Replaces the read cipher and MAC.
    pub fn install(&mut self, cipher: Box<dyn PacketCipher>, mac: Box<dyn PacketMac>) {
        self.cipher = cipher;
        self.mac = mac;
    }

    pub(crate) fn buffered(&mut self) -> &mut BufReader<R> {
        &mut self.reader
    }

    /// Reads, decrypts and authenticates one packet.
    ///
    /// Returns the payload, message code first.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Io`] if the stream ends or fails
    /// - [`KestrelError::Protocol`] for an oversized or malformed frame
    /// - [`KestrelError::InvalidMac`] if authentication fails
    pub async fn read_packet(&mut self) -> KestrelResult<Vec<u8>> {
        let block = framing_block_size(self.cipher.block_size());
        let mut packet = vec![0u8; block];
        self.reader.read_exact(&mut packet).await?;
        self.cipher.apply(&mut packet)?;

        let header = FrameHeader::parse(&packet, self.mac.size())?;
        packet.resize(block + header.remainder, 0);
        self.reader.read_exact(&mut packet[block..]).await?;

        let framed = packet.len() - self.mac.size();
        self.cipher.apply(&mut packet[block..framed])?;
        let (body, tag) = packet.split_at(framed);
        self.mac.verify(self.sequence, body, tag)?;
        self.sequence = self.sequence.wrapping_add(1);

        Ok(packet[header.payload_range()].to_vec())
    }
}

/// Outbound half: writer, write cipher, write MAC, write sequence.
pub struct PacketWriter<W> {
    writer: W,
    cipher: Box<dyn PacketCipher>,
    mac: Box<dyn PacketMac>,
    sequence: u32,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Creates a writer in the unencrypted phase.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            cipher: Box::new(NullCipher),
            mac: Box::new(NullMac),
            sequence: 0,
        }
    }

    /// Sequence number of the next packet to write.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Replaces the write cipher and MAC.
    pub fn install(&mut self, cipher: Box<dyn PacketCipher>, mac: Box<dyn PacketMac>) {
        self.cipher = cipher;
        self.mac = mac;
    }

    pub(crate) fn raw(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Seals and sends one packet.
    pub async fn write_packet(&mut self, packet: PacketBuilder) -> KestrelResult<()> {
        let wire = packet.seal(self.cipher.as_mut(), self.mac.as_ref(), self.sequence)?;
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> KestrelResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// One SSH connection's transport state.
pub struct Transport<S> {
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    client_ident: String,
    server_ident: String,
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    session_id: Option<Vec<u8>>,
    logger: Arc<dyn Logger>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Wraps `stream` and runs the identification exchange.
    pub async fn connect(stream: S, product: &str, logger: Arc<dyn Logger>) -> KestrelResult<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(BufReader::new(read_half));
        let mut writer = PacketWriter::new(write_half);

        let local = Version::new(product, None);
        let server_ident =
            version::exchange(reader.buffered(), writer.raw(), &local, logger.as_ref()).await?;

        Ok(Self {
            reader,
            writer,
            client_ident: local.to_string(),
            server_ident,
            client_kexinit: Vec::new(),
            server_kexinit: Vec::new(),
            session_id: None,
            logger,
        })
    }

    /// Reads one packet payload.
    pub async fn read_packet(&mut self) -> KestrelResult<Vec<u8>> {
        self.reader.read_packet().await
    }

    /// Sends one packet.
    pub async fn write_packet(&mut self, packet: PacketBuilder) -> KestrelResult<()> {
        self.writer.write_packet(packet).await
    }

    /// Sends our KEXINIT and keeps its payload for the exchange hash.
    pub async fn write_kex_init(&mut self, kex_init: &KexInit) -> KestrelResult<()> {
        let payload = kex_init.to_bytes();
        self.writer
            .write_packet(PacketBuilder::from_payload(&payload))
            .await?;
        self.client_kexinit = payload;
        Ok(())
    }

    /// Records the peer's raw KEXINIT payload.
    pub fn set_server_kexinit(&mut self, payload: Vec<u8>) {
        self.server_kexinit = payload;
    }

    /// Records `hash` as the session identifier unless one is already set.
    ///
    /// Returns the session identifier in effect.
    pub fn set_session_id(&mut self, hash: &[u8]) -> &[u8] {
        self.session_id.get_or_insert_with(|| hash.to_vec())
    }

    /// Replaces both directions' cipher and MAC.
    pub fn install_keys(
        &mut self,
        read: (Box<dyn PacketCipher>, Box<dyn PacketMac>),
        write: (Box<dyn PacketCipher>, Box<dyn PacketMac>),
    ) {
        self.reader.install(read.0, read.1);
        self.writer.install(write.0, write.1);
        self.logger.debug(format_args!(
            "transport keys active (read seq {}, write seq {})",
            self.reader.sequence(),
            self.writer.sequence()
        ));
    }

    /// Separates the transport into its two packet halves.
    pub fn into_split(self) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl<S> Transport<S> {
    /// Our identification line without CR LF.
    pub fn client_ident(&self) -> &str {
        &self.client_ident
    }

    /// The server's identification line without CR LF.
    pub fn server_ident(&self) -> &str {
        &self.server_ident
    }

    /// Our last KEXINIT payload.
    pub fn client_kexinit(&self) -> &[u8] {
        &self.client_kexinit
    }

    /// The server's last KEXINIT payload.
    pub fn server_kexinit(&self) -> &[u8] {
        &self.server_kexinit
    }

    /// Exchange hash of the first key exchange, once it completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Read sequence counter.
    pub fn read_sequence(&self) -> u32 {
        self.reader.sequence
    }

    /// Write sequence counter.
    pub fn write_sequence(&self) -> u32 {
        self.writer.sequence
    }

    /// The connection's logger.
    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }
}

/// Converts a clean end of stream into [`KestrelError::Closed`].
pub fn eof_as_closed(err: KestrelError) -> KestrelError {
    match err {
        KestrelError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            KestrelError::Closed
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{new_cipher, new_mac, CipherAlgorithm, Direction, MacAlgorithm};
    use crate::ssh::message::MessageType;
    use kestrel_platform::NullLogger;
    use tokio::io::duplex;

    type Keys = (Box<dyn PacketCipher>, Box<dyn PacketMac>);

    fn keys(alg: CipherAlgorithm, direction: Direction) -> Keys {
        let key = vec![0x5a; alg.key_size()];
        let iv = vec![0xa5; alg.iv_size()];
        (
            new_cipher(alg, direction, &key, &iv).unwrap(),
            new_mac(MacAlgorithm::HmacSha1, &[0x33; 20]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_framing_over_pipe_every_cipher() {
        for alg in CipherAlgorithm::ALL {
            let (a, b) = duplex(1 << 20);
            let mut writer = PacketWriter::new(a);
            let mut reader = PacketReader::new(BufReader::new(b));

            // First packet in the clear, the rest encrypted
            writer
                .write_packet(PacketBuilder::from_payload(b"\x15"))
                .await
                .unwrap();
            assert_eq!(reader.read_packet().await.unwrap(), b"\x15");

            let (c, m) = keys(alg, Direction::Encrypt);
            writer.install(c, m);
            let (c, m) = keys(alg, Direction::Decrypt);
            reader.install(c, m);

            for size in [1usize, 7, 16, 31, 1000, 32768] {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                writer
                    .write_packet(PacketBuilder::from_payload(&payload))
                    .await
                    .unwrap();
                assert_eq!(reader.read_packet().await.unwrap(), payload);
            }

            assert_eq!(writer.sequence(), 7);
            assert_eq!(reader.sequence(), 7);
        }
    }

    #[tokio::test]
    async fn test_mac_failure_over_pipe() {
        let (a, mut b) = duplex(1 << 16);
        let mut writer = PacketWriter::new(a);
        let (c, m) = keys(CipherAlgorithm::Aes128Ctr, Direction::Encrypt);
        writer.install(c, m);
        writer
            .write_packet(PacketBuilder::from_payload(b"attack at dawn"))
            .await
            .unwrap();
        drop(writer);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;

        let mut reader = PacketReader::new(BufReader::new(&wire[..]));
        let (c, m) = keys(CipherAlgorithm::Aes128Ctr, Direction::Decrypt);
        reader.install(c, m);
        assert!(matches!(
            reader.read_packet().await,
            Err(KestrelError::InvalidMac)
        ));
        assert_eq!(reader.sequence(), 0);
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let wire = [0u8, 0, 0, 28, 4, 2];
        let mut reader = PacketReader::new(BufReader::new(&wire[..]));
        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(eof_as_closed(err), KestrelError::Closed));
    }

    #[tokio::test]
    async fn test_connect_and_session_id_set_once() {
        let (client_end, server_end) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut server = PacketWriter::new(server_end);
            server
                .raw()
                .write_all(b"SSH-2.0-OpenSSH_x\r\n")
                .await
                .unwrap();
            let mut ignore = PacketBuilder::new(MessageType::Ignore);
            ignore.string("");
            server.write_packet(ignore).await.unwrap();
            server
        });

        let mut transport = Transport::connect(client_end, "kestrel_0.1", Arc::new(NullLogger))
            .await
            .unwrap();
        assert_eq!(transport.client_ident(), "SSH-2.0-kestrel_0.1");
        assert_eq!(transport.server_ident(), "SSH-2.0-OpenSSH_x");

        let payload = transport.read_packet().await.unwrap();
        assert_eq!(payload[0], MessageType::Ignore as u8);
        assert_eq!(transport.read_sequence(), 1);

        assert!(transport.session_id().is_none());
        assert_eq!(transport.set_session_id(&[1, 2, 3]), &[1, 2, 3]);
        assert_eq!(transport.set_session_id(&[9, 9, 9]), &[1, 2, 3]);
        assert_eq!(transport.session_id(), Some(&[1u8, 2, 3][..]));

        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_kex_init_retains_payload() {
        let (client_end, mut server_end) = duplex(1 << 16);
        server_end.write_all(b"SSH-2.0-peer\r\n").await.unwrap();

        let mut transport = Transport::connect(client_end, "kestrel_0.1", Arc::new(NullLogger))
            .await
            .unwrap();
        let kex_init = KexInit::new(&Default::default());
        transport.write_kex_init(&kex_init).await.unwrap();

        assert_eq!(transport.client_kexinit(), kex_init.to_bytes().as_slice());
        assert_eq!(transport.client_kexinit()[0], MessageType::KexInit as u8);
        assert_eq!(transport.write_sequence(), 1);
    }
}
