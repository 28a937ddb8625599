//! Connection admission and packet dispatch for QUIC-style datagram servers
//!
//! This crate contains the deterministic core that sits between a UDP socket
//! and a set of per-connection protocol engines: it reads just enough of each
//! datagram's unencrypted header to decide which logical connection it belongs
//! to, then routes it — to an existing session, to a newly admitted one, into
//! a bounded buffer while the connection's setup packet is still in flight, or
//! to a time-bounded responder for connections that already terminated.
//!
//! The crate performs no I/O and reads no clocks. The embedding event loop
//! feeds datagrams to [`Dispatcher::ingest`], provides the shared outbound
//! socket behind the [`PacketWriter`] trait, and drives maintenance through
//! [`Dispatcher::poll_timeout`] / [`Dispatcher::handle_timeout`]. Everything a
//! connection does beyond admission and routing lives behind the opaque
//! [`Session`] trait.

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

mod admission;
mod buffered;
mod config;
mod dispatcher;
mod handshake;
mod packet;
mod session;
mod shared;
#[cfg(test)]
mod tests;
mod time_wait;
mod write_blocked;
mod writer;

pub use crate::admission::{
    AdmissionDecision, AdmissionPolicy, AdmissionVerifier, AllowAllPolicy, Evaluation,
    RejectionUnsupported,
};
pub use crate::config::{ConfigError, DispatchConfig};
pub use crate::dispatcher::{DispatchStats, Dispatcher};
pub use crate::handshake::ClientHello;
pub use crate::packet::{PacketDecodeError, PublicHeader};
pub use crate::session::{Session, SessionFactory, SessionSignal};
pub use crate::shared::{
    ConnectionId, Datagram, ErrorCode, Version, CONNECTION_ID_LEN, DEFAULT_SUPPORTED_VERSIONS,
};
pub use crate::writer::{PacketWriter, SharedWriter, WriteResult};
