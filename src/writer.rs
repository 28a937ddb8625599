use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

/// Outcome of a single non-blocking write attempt
#[derive(Debug)]
pub enum WriteResult {
    /// The datagram was handed to the socket
    Sent,
    /// The socket cannot accept more data right now; the datagram was not sent
    Blocked,
    /// The write failed outright
    Error(io::Error),
}

/// The shared outbound socket, as seen by the dispatch core
///
/// Implementations must never block: a send that would block reports
/// [`WriteResult::Blocked`] and leaves the writer in the blocked state until
/// the environment observes writability again. On that transition the
/// environment calls [`Dispatcher::on_can_write`](crate::Dispatcher::on_can_write),
/// which in turn calls [`set_writable`](Self::set_writable) before draining
/// blocked writers.
pub trait PacketWriter {
    /// Attempt to send one datagram from `server_addr` to `client_addr`
    fn write(&mut self, data: &[u8], server_addr: SocketAddr, client_addr: SocketAddr)
        -> WriteResult;

    /// Whether the last write attempt left the socket blocked
    fn is_blocked(&self) -> bool;

    /// Clear the blocked state after the socket reported writable
    fn set_writable(&mut self);
}

/// Handle to the one writer shared by sessions, the time-wait list, and the
/// dispatcher itself
///
/// The whole subsystem is single-threaded by construction, so interior
/// mutability through `RefCell` suffices; contention for the socket is
/// arbitrated by the dispatcher's write-blocked list, not by locking.
pub type SharedWriter = Rc<RefCell<dyn PacketWriter>>;
