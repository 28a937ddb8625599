//! Recognition of connection-setup packets
//!
//! The dispatcher needs exactly one fact about a payload it cannot yet
//! authenticate: does it open with the client's handshake message? Anything
//! deeper is the session's business.

use bytes::Bytes;

use crate::packet::FRAME_HANDSHAKE;

/// Tag opening every client handshake message
pub(crate) const CLIENT_HELLO_TAG: [u8; 4] = *b"CHLO";

/// The client's initial handshake message, extracted from a setup packet
///
/// The message body is opaque here; admission policy and the proof subsystem
/// interpret it.
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// The handshake message, tag included
    pub message: Bytes,
}

impl ClientHello {
    /// Extract the client hello from a datagram payload, if it is one
    ///
    /// A setup packet carries a handshake frame at offset zero whose message
    /// opens with the client-hello tag. Any other payload yields `None`.
    pub fn extract(payload: &[u8]) -> Option<Self> {
        if *payload.first()? != FRAME_HANDSHAKE {
            return None;
        }
        let offset = u32::from_be_bytes(payload.get(1..5)?.try_into().ok()?);
        if offset != 0 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes(payload.get(5..7)?.try_into().ok()?));
        let message = payload.get(7..7 + len)?;
        if message.len() < CLIENT_HELLO_TAG.len() || message[..4] != CLIENT_HELLO_TAG {
            return None;
        }
        Some(Self {
            message: Bytes::copy_from_slice(message),
        })
    }
}
