//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! # Constraints
//!
//! - `packet_length` covers everything after itself except the MAC
//! - `padding_length` is at least 4
//! - `4 + packet_length` is a multiple of the cipher block size, and never
//!   framed with a block smaller than 16 bytes
//! - A packet announcing more than [`MAX_REMAINDER`] bytes past its first
//!   block is rejected before any allocation
//!
//! The MAC is always computed over `sequence_number || plaintext packet`,
//! before encryption on the way out and after decryption on the way in.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::crypto::{NullCipher, NullMac};
//! use kestrel_proto::ssh::message::MessageType;
//! use kestrel_proto::ssh::packet::PacketBuilder;
//!
//! let mut builder = PacketBuilder::new(MessageType::Ignore);
//! builder.string("padding");
//! assert_eq!(builder.payload()[0], 2);
//!
//! let wire = builder.seal(&mut NullCipher, &NullMac, 0).unwrap();
//! assert_eq!(wire.len() % 16, 0);
//! ```

use crate::ssh::codec::Encoder;
use crate::ssh::crypto::{PacketCipher, PacketMac};
use crate::ssh::message::MessageType;
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;
use std::ops::{Deref, DerefMut};

/// `packet_length` plus `padding_length`.
pub const HEADER_LEN: usize = 5;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Smallest block used for framing, whatever the cipher reports.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Ceiling on the bytes read after the first block of a packet (12 MiB).
pub const MAX_REMAINDER: usize = 12 * 1024 * 1024;

/// Returns the framing block size for a cipher block size.
pub fn framing_block_size(cipher_block_size: usize) -> usize {
    cipher_block_size.max(MIN_BLOCK_SIZE)
}

/// Padding needed after `unpadded_len` bytes (header and payload).
pub fn padding_len(unpadded_len: usize, cipher_block_size: usize) -> usize {
    let bs = framing_block_size(cipher_block_size);
    let mut padding = bs - unpadded_len % bs;
    if padding < MIN_PADDING_LEN {
        padding += bs;
    }
    padding
}

/// Outbound packet under construction.
///
/// Starts with [`HEADER_LEN`] reserved bytes that [`seal`](Self::seal) fills
/// in. Derefs to [`Encoder`], so payload fields are appended with the codec
/// methods directly.
#[derive(Debug)]
pub struct PacketBuilder {
    enc: Encoder,
}

impl PacketBuilder {
    /// Starts a packet whose payload begins with `code`.
    pub fn new(code: MessageType) -> Self {
        let mut enc = Encoder::with_reserved(HEADER_LEN);
        enc.u8(code as u8);
        Self { enc }
    }

    /// Starts a packet with an arbitrary, already encoded payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut enc = Encoder::with_reserved(HEADER_LEN);
        enc.raw(payload);
        Self { enc }
    }

    /// Payload bytes appended so far, message code included.
    pub fn payload(&self) -> &[u8] {
        &self.enc.as_ref()[HEADER_LEN..]
    }

    /// Frames, MACs and encrypts the packet.
    ///
    /// `sequence` is the write sequence number for this packet; the caller
    /// increments it once the bytes are on the wire.
    pub fn seal(
        self,
        cipher: &mut dyn PacketCipher,
        mac: &dyn PacketMac,
        sequence: u32,
    ) -> KestrelResult<Vec<u8>> {
        let mut buf = self.enc.into_vec();
        let padding = padding_len(buf.len(), cipher.block_size());
        let start = buf.len();
        buf.resize(start + padding, 0);
        rand::thread_rng().fill_bytes(&mut buf[start..]);

        let packet_length = u32::try_from(buf.len() - 4)
            .map_err(|_| KestrelError::Protocol("Packet too large to frame".to_string()))?;
        buf[..4].copy_from_slice(&packet_length.to_be_bytes());
        buf[4] = padding as u8;

        let tag = mac.compute(sequence, &buf);
        cipher.apply(&mut buf)?;
        buf.extend_from_slice(&tag);
        Ok(buf)
    }
}

impl Deref for PacketBuilder {
    type Target = Encoder;

    fn deref(&self) -> &Encoder {
        &self.enc
    }
}

impl DerefMut for PacketBuilder {
    fn deref_mut(&mut self) -> &mut Encoder {
        &mut self.enc
    }
}

/// Lengths decoded from the decrypted first block of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// `packet_length` field.
    pub packet_length: usize,
    /// `padding_length` field.
    pub padding_length: usize,
    /// Bytes still to read after the first block, MAC included.
    pub remainder: usize,
}

impl FrameHeader {
    /// Validates the header of a packet whose first block is `first_block`.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the packet is shorter than its
    /// first block, longer than [`MAX_REMAINDER`], or leaves no room for its
    /// padding.
    pub fn parse(first_block: &[u8], mac_size: usize) -> KestrelResult<Self> {
        if first_block.len() < HEADER_LEN {
            return Err(KestrelError::Protocol("Packet header truncated".to_string()));
        }
        let packet_length = u32::from_be_bytes([
            first_block[0],
            first_block[1],
            first_block[2],
            first_block[3],
        ]) as usize;
        let padding_length = first_block[4] as usize;
        let block = first_block.len();

        let framed = 4 + packet_length;
        if framed + mac_size < block {
            return Err(KestrelError::Protocol(format!(
                "Packet too small: packet_length {}",
                packet_length
            )));
        }
        let remainder = framed + mac_size - block;
        if remainder > MAX_REMAINDER {
            return Err(KestrelError::Protocol(format!(
                "Packet too large: {} bytes after the first block (max {})",
                remainder, MAX_REMAINDER
            )));
        }
        if framed < block {
            return Err(KestrelError::Protocol(format!(
                "Packet length {} is shorter than the first block",
                packet_length
            )));
        }
        if padding_length + 1 > packet_length {
            return Err(KestrelError::Protocol(format!(
                "Padding length {} exceeds packet length {}",
                padding_length, packet_length
            )));
        }

        Ok(Self {
            packet_length,
            padding_length,
            remainder,
        })
    }

    /// Range of the payload inside the full plaintext packet.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        HEADER_LEN..4 + self.packet_length - self.padding_length
    }
}

/// Opens a complete sealed packet held in memory.
///
/// This is the same procedure the transport reader runs over a socket, for
/// callers that already have every byte.
pub fn open(
    wire: &[u8],
    cipher: &mut dyn PacketCipher,
    mac: &dyn PacketMac,
    sequence: u32,
) -> KestrelResult<Vec<u8>> {
    let block = framing_block_size(cipher.block_size());
    if wire.len() < block {
        return Err(KestrelError::Protocol("Packet truncated".to_string()));
    }
    let mut packet = wire[..block].to_vec();
    cipher.apply(&mut packet)?;
    let header = FrameHeader::parse(&packet, mac.size())?;
    if wire.len() < block + header.remainder {
        return Err(KestrelError::Protocol("Packet truncated".to_string()));
    }
    packet.extend_from_slice(&wire[block..block + header.remainder]);

    let framed = packet.len() - mac.size();
    cipher.apply(&mut packet[block..framed])?;
    mac.verify(sequence, &packet[..framed], &packet[framed..])?;
    Ok(packet[header.payload_range()].to_vec())
}
