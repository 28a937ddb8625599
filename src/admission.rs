//! Admission policy and stateless rejection
//!
//! Before the dispatcher spends per-connection memory on an unauthenticated
//! attempt it can consult two collaborators: a cheap local policy over the
//! client hello, and a cryptographic reject/accept decision that may resolve
//! asynchronously. Neither is given any connection state to hold.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::handshake::ClientHello;
use crate::shared::{ConnectionId, ErrorCode, Version};

/// Verdict of the cryptographic admission check
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// The hello is complete and valid; admit the connection
    Accept,
    /// The client must retry with the enclosed reply (proof demand, echoed
    /// source-address token, ...); no session is created
    Reject(Bytes),
    /// The hello could not be processed at all
    Fail(ErrorCode, String),
    /// Stateless rejection is unavailable; admit as if accepted
    Unsupported,
}

/// How the verifier answered an evaluation request
#[derive(Debug, Clone)]
pub enum Evaluation {
    /// The decision is available immediately
    Ready(AdmissionDecision),
    /// The decision will arrive later through
    /// [`Dispatcher::on_admission_decision`](crate::Dispatcher::on_admission_decision).
    /// The dispatcher keeps serving other connection IDs in the interim.
    Pending,
}

/// Local, synchronous say over which connection attempts may proceed
pub trait AdmissionPolicy {
    /// Global gate on the whole stateless-rejection pass, e.g. under memory
    /// pressure
    fn should_attempt_stateless_reject(&mut self) -> bool {
        true
    }

    /// Cheap policy check over a client hello, with no per-connection state
    ///
    /// An `Err` carries the detail string for the stateless close sent back.
    fn can_accept(&mut self, hello: &ClientHello, server_addr: SocketAddr)
        -> Result<(), String>;
}

/// The cryptographic proof/verification subsystem, seen as a black box
pub trait AdmissionVerifier {
    /// Judge a client hello for `id`
    ///
    /// Implementations that need to consult slow or remote machinery return
    /// [`Evaluation::Pending`] and deliver the verdict later on the same
    /// event-loop thread; a verdict for an ID that has since been admitted,
    /// expired, or moved to time-wait is discarded as a no-op.
    fn evaluate(
        &mut self,
        hello: &ClientHello,
        id: ConnectionId,
        version: Version,
        server_addr: SocketAddr,
        client_addr: SocketAddr,
    ) -> Evaluation;
}

/// Policy that admits every hello
pub struct AllowAllPolicy;

impl AdmissionPolicy for AllowAllPolicy {
    fn can_accept(&mut self, _: &ClientHello, _: SocketAddr) -> Result<(), String> {
        Ok(())
    }
}

/// Verifier for deployments without stateless rejection: every hello resolves
/// to [`AdmissionDecision::Unsupported`], so connections are admitted directly
pub struct RejectionUnsupported;

impl AdmissionVerifier for RejectionUnsupported {
    fn evaluate(
        &mut self,
        _: &ClientHello,
        _: ConnectionId,
        _: Version,
        _: SocketAddr,
        _: SocketAddr,
    ) -> Evaluation {
        Evaluation::Ready(AdmissionDecision::Unsupported)
    }
}
