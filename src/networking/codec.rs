//! Outer packet framing.
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  |   12 bytes   | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |             Payload (Length bytes)            |
//! +-----------------------------------------------+
//! ```
//!
//! - Magic: network identifier, big-endian
//! - Command: ASCII name, NUL padded
//! - Length: little-endian payload length
//! - Checksum: first 4 bytes of SHA-256d(payload)

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::crypto::checksum;
use crate::networking::messages::NetworkMessage;
use crate::{Error, Result};

pub const BLOCKNET_MAGIC: u32 = 0xa1a0_a2a3;
pub const HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;
pub const MAX_PAYLOAD_SIZE: usize = 0x0200_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

/// Parse the 24-byte outer header at the start of `buf`.
pub fn decode_header(buf: &[u8], magic: u32) -> Result<PacketHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let actual = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if actual != magic {
        return Err(Error::BadMagic {
            expected: magic,
            actual,
        });
    }

    let raw_command = &buf[4..4 + COMMAND_SIZE];
    let end = raw_command
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(COMMAND_SIZE);
    if !raw_command[..end].is_ascii() || raw_command[end..].iter().any(|b| *b != 0) {
        return Err(Error::Malformed(String::from("command name is not NUL padded ASCII")));
    }
    let command = String::from_utf8_lossy(&raw_command[..end]).into_owned();

    let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(Error::MessageTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(PacketHeader {
        command,
        length,
        checksum: [buf[20], buf[21], buf[22], buf[23]],
    })
}

/// Check the payload against the header and decode it.
pub fn decode_body(header: &PacketHeader, payload: &[u8]) -> Result<NetworkMessage> {
    if payload.len() != header.length {
        return Err(Error::Truncated {
            needed: header.length,
            available: payload.len(),
        });
    }
    if checksum(payload) != header.checksum {
        return Err(Error::ChecksumMismatch);
    }
    NetworkMessage::decode(&header.command, payload)
}

pub fn encode(message: &NetworkMessage, magic: u32) -> Result<Vec<u8>> {
    let command = message.command();
    if command.len() > COMMAND_SIZE || !command.is_ascii() {
        return Err(Error::Malformed(format!("command '{}' does not fit the header", command)));
    }
    let payload = message.payload();
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.put_u32(magic);
    let mut name = [0u8; COMMAND_SIZE];
    name[..command.len()].copy_from_slice(command.as_bytes());
    out.put_slice(&name);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(&checksum(&payload));
    out.put_slice(&payload);
    Ok(out)
}

/// One framed packet whose payload has not been checked or decoded yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn decode(&self) -> Result<NetworkMessage> {
        decode_body(&self.header, &self.payload)
    }
}

/// Splits a TCP stream into [`Frame`]s. Header errors end the stream; payload
/// errors surface per frame from [`Frame::decode`].
///
/// When a header announces more bytes than are buffered, the header is kept
/// and the codec waits for the rest of the payload before emitting the frame.
pub struct FrameCodec {
    magic: u32,
    pending: Option<PacketHeader>,
}

impl FrameCodec {
    pub fn new(magic: u32) -> Self {
        FrameCodec {
            magic,
            pending: None,
        }
    }

    /// True while a large payload is being accumulated.
    pub fn is_accumulating(&self) -> bool {
        self.pending.is_some()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(BLOCKNET_MAGIC)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = decode_header(&src[..HEADER_SIZE], self.magic)?;
                src.advance(HEADER_SIZE);
                header
            }
        };

        if src.len() < header.length {
            trace!(
                "accumulating {} payload: {} of {} bytes",
                header.command,
                src.len(),
                header.length
            );
            src.reserve(header.length - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.length).to_vec();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<NetworkMessage> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: NetworkMessage, dst: &mut BytesMut) -> Result<()> {
        let bytes = encode(&item, self.magic)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::networking::xrouter::{XRouterBody, XRouterCommand, XRouterMessage, FREE_PAYMENT};

    fn ping_frame() -> Vec<u8> {
        encode(&NetworkMessage::Ping(7), BLOCKNET_MAGIC).unwrap()
    }

    #[test]
    fn header_layout_test() {
        let bytes = ping_frame();
        assert_eq!(&bytes[0..4], &[0xa1, 0xa0, 0xa2, 0xa3]);
        assert_eq!(&bytes[4..16], b"ping\0\0\0\0\0\0\0\0");
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &checksum(&7u64.to_le_bytes()));

        let header = decode_header(&bytes, BLOCKNET_MAGIC).unwrap();
        assert_eq!(header.command, "ping");
        assert_eq!(header.length, 8);
        assert_eq!(
            decode_body(&header, &bytes[HEADER_SIZE..]).unwrap(),
            NetworkMessage::Ping(7)
        );
    }

    #[test]
    fn corrupted_payload_fails_checksum_test() {
        let bytes = ping_frame();
        for index in HEADER_SIZE..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 0x80;
            let header = decode_header(&corrupted, BLOCKNET_MAGIC).unwrap();
            assert!(matches!(
                decode_body(&header, &corrupted[HEADER_SIZE..]),
                Err(Error::ChecksumMismatch)
            ));
        }
    }

    #[test]
    fn bad_magic_and_truncation_test() {
        let bytes = ping_frame();
        assert!(matches!(
            decode_header(&bytes[..10], BLOCKNET_MAGIC),
            Err(Error::Truncated { .. })
        ));
        assert!(matches!(
            decode_header(&bytes, 0x0102_0304),
            Err(Error::BadMagic { .. })
        ));

        let mut oversized = bytes;
        oversized[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_le_bytes());
        assert!(matches!(
            decode_header(&oversized, BLOCKNET_MAGIC),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn large_message_accumulates_across_reads_test() {
        let keypair = Keypair::new();
        let message = NetworkMessage::XRouter(
            XRouterMessage::new_signed(
                XRouterCommand::SendTransaction,
                None,
                XRouterBody::Query {
                    currency: "BLOCK".into(),
                    payment: FREE_PAYMENT.into(),
                    params: vec!["00".repeat(4000)],
                },
                &keypair,
                1_600_000_000,
            )
            .unwrap(),
        );
        let mut bytes = encode(&message, BLOCKNET_MAGIC).unwrap();
        // a second frame directly behind the first must survive intact
        bytes.extend_from_slice(&ping_frame());

        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        let mut decoded = vec![];
        for chunk in bytes.chunks(1000) {
            src.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                decoded.push(frame.decode().unwrap());
            }
        }
        assert_eq!(decoded, vec![message, NetworkMessage::Ping(7)]);
        assert!(src.is_empty());
        assert!(!codec.is_accumulating());
    }

    #[test]
    fn encoder_matches_encode_test() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(NetworkMessage::Verack, &mut dst).unwrap();
        assert_eq!(dst.to_vec(), encode(&NetworkMessage::Verack, BLOCKNET_MAGIC).unwrap());
        assert_eq!(dst.len(), HEADER_SIZE);
    }
}
