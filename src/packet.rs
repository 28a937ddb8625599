//! Minimal public-header codec
//!
//! Only the unencrypted public header is modeled here: just enough to route a
//! datagram to a connection, plus the server-built packets the dispatcher
//! synthesizes itself (version negotiation, public reset, stateless
//! termination). Everything past the header belongs to the opaque session.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::shared::{ConnectionId, Version, CONNECTION_ID_LEN};

/// The packet carries an explicit protocol version.
const FLAG_VERSION: u8 = 0x01;
/// The packet is a public reset.
const FLAG_RESET: u8 = 0x02;
/// An 8-byte connection ID follows the flags byte.
const FLAG_CONNECTION_ID: u8 = 0x08;
/// Bits selecting the packet number encoding length.
const FLAG_PACKET_NUMBER_MASK: u8 = 0x30;

/// Frame type for handshake payload carried in termination/reject packets.
pub(crate) const FRAME_HANDSHAKE: u8 = 0x01;
/// Frame type for a stateless connection close.
pub(crate) const FRAME_CLOSE: u8 = 0x02;

/// Largest packet number a client can plausibly have reached before the server
/// has ever responded. Anything above this on a first-contact packet is
/// treated as a stray from a forgotten connection.
pub(crate) const MAX_REASONABLE_INITIAL_PACKET_NUMBER: u64 = 100;

/// Ceiling on datagrams we synthesize, leaving headroom for tunneling overhead
pub(crate) const MAX_PACKET_SIZE: usize = 1350;

/// Errors encountered while decoding a public header
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    /// The datagram ended before the header was complete
    #[error("unexpected end of packet")]
    UnexpectedEnd,
}

/// The unauthenticated public header shared by every datagram
///
/// Decoding reads nothing beyond the routing fields; the payload remains
/// untouched for the session (or the handshake extractor) to interpret.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PublicHeader {
    /// Whether the packet declares a protocol version
    pub version_flag: bool,
    /// Whether the packet is a public reset
    pub reset_flag: bool,
    /// The connection ID, if the header used the accepted 8-byte class
    pub connection_id: Option<ConnectionId>,
    /// Declared protocol version, when `version_flag` is set
    pub version: Option<Version>,
    /// Packet number, absent on resets which carry none
    pub packet_number: Option<u64>,
    /// Number of bytes the header occupied
    pub header_len: usize,
}

impl PublicHeader {
    /// Decode the public header from the front of a datagram
    pub fn decode(data: &[u8]) -> Result<Self, PacketDecodeError> {
        let mut r = Reader(data);
        let flags = r.u8()?;
        let version_flag = flags & FLAG_VERSION != 0;
        let reset_flag = flags & FLAG_RESET != 0;

        let connection_id = if flags & FLAG_CONNECTION_ID != 0 {
            let mut bytes = [0; CONNECTION_ID_LEN];
            bytes.copy_from_slice(r.take(CONNECTION_ID_LEN)?);
            Some(ConnectionId::new(bytes))
        } else {
            None
        };

        let version = if version_flag && !reset_flag {
            Some(u32::from_be_bytes(r.take(4)?.try_into().unwrap()))
        } else {
            None
        };

        let packet_number = if reset_flag {
            // Public resets carry a nonce proof instead of a packet number
            None
        } else {
            let len = packet_number_len(flags);
            let mut number = 0u64;
            for &byte in r.take(len)? {
                number = number << 8 | u64::from(byte);
            }
            Some(number)
        };

        Ok(Self {
            version_flag,
            reset_flag,
            connection_id,
            version,
            packet_number,
            header_len: data.len() - r.0.len(),
        })
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, PacketDecodeError> {
        let (&x, rest) = self.0.split_first().ok_or(PacketDecodeError::UnexpectedEnd)?;
        self.0 = rest;
        Ok(x)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketDecodeError> {
        if self.0.len() < n {
            return Err(PacketDecodeError::UnexpectedEnd);
        }
        let (x, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(x)
    }
}

fn packet_number_len(flags: u8) -> usize {
    match flags & FLAG_PACKET_NUMBER_MASK {
        0x00 => 1,
        0x10 => 2,
        0x20 => 4,
        _ => 6,
    }
}

fn packet_number_flags(number: u64) -> (u8, usize) {
    match number {
        0..=0xff => (0x00, 1),
        0x100..=0xffff => (0x10, 2),
        0x1_0000..=0xffff_ffff => (0x20, 4),
        _ => (0x30, 6),
    }
}

fn put_packet_number(buf: &mut BytesMut, number: u64, len: usize) {
    buf.put_slice(&number.to_be_bytes()[8 - len..]);
}

/// Build a regular data packet
///
/// `version` is set on client-originated packets only; server-built packets
/// omit it.
pub(crate) fn build_data_packet(
    id: ConnectionId,
    version: Option<Version>,
    packet_number: u64,
    payload: &[u8],
) -> Bytes {
    let (pn_flags, pn_len) = packet_number_flags(packet_number);
    let mut buf = BytesMut::with_capacity(1 + CONNECTION_ID_LEN + 4 + pn_len + payload.len());
    let mut flags = FLAG_CONNECTION_ID | pn_flags;
    if version.is_some() {
        flags |= FLAG_VERSION;
    }
    buf.put_u8(flags);
    buf.put_slice(id.as_bytes());
    if let Some(v) = version {
        buf.put_u32(v);
    }
    put_packet_number(&mut buf, packet_number, pn_len);
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a version negotiation packet listing every supported version
pub(crate) fn build_version_negotiation(id: ConnectionId, versions: &[Version]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + CONNECTION_ID_LEN + versions.len() * 4);
    buf.put_u8(FLAG_VERSION | FLAG_CONNECTION_ID);
    buf.put_slice(id.as_bytes());
    for &v in versions {
        buf.put_u32(v);
    }
    buf.freeze()
}

/// Build a public reset carrying a reproducible nonce proof and the packet
/// number that provoked it
pub(crate) fn build_public_reset(
    id: ConnectionId,
    nonce_proof: u64,
    rejected_packet_number: u64,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + CONNECTION_ID_LEN + 16);
    buf.put_u8(FLAG_RESET | FLAG_CONNECTION_ID);
    buf.put_slice(id.as_bytes());
    buf.put_u64(nonce_proof);
    buf.put_u64(rejected_packet_number);
    buf.freeze()
}

/// Build the payload of a stateless connection close
pub(crate) fn build_close_payload(error_code: u32, reason: &str) -> Bytes {
    let reason = &reason.as_bytes()[..reason.len().min(u16::MAX as usize)];
    let mut buf = BytesMut::with_capacity(7 + reason.len());
    buf.put_u8(FRAME_CLOSE);
    buf.put_u32(error_code);
    buf.put_u16(reason.len() as u16);
    buf.put_slice(reason);
    buf.freeze()
}

/// Split a handshake reply into as many packets as it takes to carry it,
/// framed as handshake data at increasing offsets
pub(crate) fn build_handshake_packets(id: ConnectionId, reply: &[u8]) -> Vec<Bytes> {
    // Frame overhead: type + offset + length
    const FRAME_OVERHEAD: usize = 7;
    let chunk_len = MAX_PACKET_SIZE - 1 - CONNECTION_ID_LEN - 6 - FRAME_OVERHEAD;
    let mut packets = Vec::with_capacity(reply.len() / chunk_len + 1);
    let mut offset = 0usize;
    let mut packet_number = 1u64;
    loop {
        let chunk = &reply[offset..reply.len().min(offset + chunk_len)];
        let mut payload = BytesMut::with_capacity(FRAME_OVERHEAD + chunk.len());
        payload.put_u8(FRAME_HANDSHAKE);
        payload.put_u32(offset as u32);
        payload.put_u16(chunk.len() as u16);
        payload.put_slice(chunk);
        packets.push(build_data_packet(id, None, packet_number, &payload));
        packet_number += 1;
        offset += chunk.len();
        if offset >= reply.len() {
            break;
        }
    }
    packets
}
