use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::shared::{ConnectionId, Datagram, ErrorCode};
use crate::writer::SharedWriter;

/// What a session reports back after handling a call from the dispatcher
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionSignal {
    /// Nothing to report
    Continue,
    /// The session tried to write and found the shared writer blocked; it
    /// wants `on_can_write` once the writer is usable again
    Blocked,
    /// The session has terminated and should be detached
    Closed {
        /// Why the session ended
        error_code: ErrorCode,
        /// Whether termination happened without ever establishing state worth
        /// keeping (e.g. a handshake-level stateless reject)
        closed_statelessly: bool,
    },
}

/// A live per-connection protocol engine
///
/// The dispatcher treats sessions as opaque: datagrams go in, signals come
/// out. Handshake progress, streams, recovery, and encryption all live behind
/// this trait. A session that terminates inside a `deliver` or `on_can_write`
/// call reports it through [`SessionSignal::Closed`]; drivers that learn of
/// closure out-of-band instead call
/// [`Dispatcher::on_connection_closed`](crate::Dispatcher::on_connection_closed).
pub trait Session {
    /// Feed one datagram to the session
    fn deliver(&mut self, now: Instant, datagram: Datagram) -> SessionSignal;

    /// The shared writer became usable again
    fn on_can_write(&mut self) -> SessionSignal;

    /// Ask the session to terminate, e.g. at server shutdown
    fn close(&mut self, error_code: ErrorCode, reason: &str);

    /// Surrender the termination datagram(s) the session produced while
    /// closing, if any, so they can be replayed from time-wait
    fn take_termination_packets(&mut self) -> Vec<Bytes>;
}

/// Builds sessions for admitted connections
pub trait SessionFactory {
    /// Create the session for a freshly admitted connection
    ///
    /// Returning `None` indicates the session could not be allocated; the
    /// inciting datagram is dropped and no state is retained.
    fn create_session(
        &mut self,
        id: ConnectionId,
        client_addr: SocketAddr,
        writer: SharedWriter,
    ) -> Option<Box<dyn Session>>;
}
