//! Connection admission and datagram routing
//!
//! The dispatcher is the single entry point for every inbound datagram and
//! every connection-lifecycle notification. It owns the session table, the
//! buffered-packet store, and the time-wait list, and is their sole writer; it
//! runs synchronously inside an external event loop, never blocks, and never
//! lets a malformed or adversarial datagram propagate an error past its own
//! boundary.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::admission::{AdmissionDecision, AdmissionPolicy, AdmissionVerifier, Evaluation};
use crate::buffered::{BufferedPacketStore, EnqueueResult};
use crate::config::{ConfigError, DispatchConfig};
use crate::handshake::ClientHello;
use crate::packet::{self, PublicHeader, MAX_REASONABLE_INITIAL_PACKET_NUMBER};
use crate::session::{Session, SessionFactory, SessionSignal};
use crate::shared::{ConnectionId, Datagram, ErrorCode, Version};
use crate::time_wait::TimeWaitList;
use crate::write_blocked::{BlockedWriter, WriteBlockedList};
use crate::writer::SharedWriter;

/// What to do with a first-contact packet for an unknown connection ID
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PacketFate {
    /// Eligible to create a session
    Process,
    /// Suspicious enough to blackhole behind a time-wait entry
    TimeWait,
    /// Hold until the connection's setup packet arrives
    Buffer,
}

struct SessionEntry {
    session: Box<dyn Session>,
    /// Version negotiated at admission, reported to time-wait at closure
    version: Version,
}

/// An admission decision that has not come back from the verifier yet
struct OutstandingDecision {
    version: Version,
    packet_number: u64,
    server_addr: SocketAddr,
    client_addr: SocketAddr,
}

/// Counters describing dispatch activity since construction
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    /// Datagrams handed to `ingest`
    pub packets_ingested: u64,
    /// Datagrams discarded without reaching a session
    pub packets_dropped: u64,
    /// Datagrams parked in the buffered-packet store
    pub packets_buffered: u64,
    /// Sessions created
    pub sessions_created: u64,
    /// Sessions closed
    pub sessions_closed: u64,
    /// Connections refused with a synthesized close, no session ever created
    pub stateless_closes: u64,
    /// Connections told to retry via a stateless reject
    pub stateless_rejects: u64,
    /// Version negotiation packets sent
    pub version_negotiations_sent: u64,
    /// Public resets synthesized for connections in time-wait
    pub public_resets_sent: u64,
}

/// Routes raw datagrams to per-connection sessions, creating, refusing, or
/// blackholing connections as policy dictates
///
/// The dispatcher performs no I/O of its own: output goes through the shared
/// [`PacketWriter`](crate::PacketWriter), time comes in through `now`
/// arguments, and the next deadline it needs is available from
/// [`poll_timeout`](Self::poll_timeout).
pub struct Dispatcher {
    config: DispatchConfig,
    sessions: FxHashMap<ConnectionId, SessionEntry>,
    /// Sessions detached from the table but not yet dropped; freed on the
    /// next timeout tick so teardown never recurses into a session that is
    /// still on the call stack
    closed_sessions: Vec<Box<dyn Session>>,
    delete_sessions_at: Option<Instant>,
    time_wait: TimeWaitList,
    buffered: BufferedPacketStore,
    write_blocked: WriteBlockedList,
    outstanding_decisions: FxHashMap<ConnectionId, OutstandingDecision>,
    writer: SharedWriter,
    factory: Box<dyn SessionFactory>,
    policy: Box<dyn AdmissionPolicy>,
    verifier: Box<dyn AdmissionVerifier>,
    /// Session-creation budget for the current event-loop pass; `None` means
    /// unlimited
    new_sessions_allowed: Option<usize>,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Create a dispatcher around the shared writer and collaborators
    ///
    /// Returns `Err` if the configuration is invalid.
    pub fn new(
        config: DispatchConfig,
        writer: SharedWriter,
        factory: Box<dyn SessionFactory>,
        policy: Box<dyn AdmissionPolicy>,
        verifier: Box<dyn AdmissionVerifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let nonce_seed = StdRng::from_entropy().gen();
        let time_wait = TimeWaitList::new(
            config.time_wait_duration,
            config.max_time_wait_entries,
            writer.clone(),
            nonce_seed,
        );
        let buffered = BufferedPacketStore::new(
            config.max_buffered_connections,
            config.max_buffered_packets_per_connection,
            config.buffered_packet_grace_period,
        );
        Ok(Self {
            config,
            sessions: FxHashMap::default(),
            closed_sessions: Vec::new(),
            delete_sessions_at: None,
            time_wait,
            buffered,
            write_blocked: WriteBlockedList::default(),
            outstanding_decisions: FxHashMap::default(),
            writer,
            factory,
            policy,
            verifier,
            new_sessions_allowed: None,
            stats: DispatchStats::default(),
        })
    }

    /// Process one received datagram
    ///
    /// Never blocks and never fails: anything unparseable or unanswerable is
    /// dropped, with nothing logged above debug level.
    pub fn ingest(
        &mut self,
        now: Instant,
        data: Bytes,
        server_addr: SocketAddr,
        client_addr: SocketAddr,
    ) {
        self.stats.packets_ingested += 1;

        // Zero source ports cannot be replied to and only appear in attempts
        // to confuse routing
        if client_addr.port() == 0 {
            trace!("dropping datagram with zero source port");
            self.stats.packets_dropped += 1;
            return;
        }

        let header = match PublicHeader::decode(&data) {
            Ok(header) => header,
            Err(e) => {
                trace!("malformed public header: {e}");
                self.stats.packets_dropped += 1;
                return;
            }
        };
        let id = match header.connection_id {
            Some(id) => id,
            None => {
                trace!("dropping datagram without a full-length connection id");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        // Datagrams for live sessions are forwarded without further checks
        if self.sessions.contains_key(&id) {
            if self.buffered.has_setup_buffered(id) {
                // The peer spoke before its own setup packet synchronized;
                // the session sorts out the ordering itself
                warn!(%id, "datagram for live session whose setup packet is still buffered");
            }
            self.deliver_to_session(
                now,
                id,
                Datagram {
                    contents: data,
                    server_addr,
                    client_addr,
                },
            );
            return;
        }

        // An unsolicited reset for an id we hold no session for is
        // unanswerable, and resets carry no packet number to validate, so
        // this also covers ids sitting in time-wait
        if header.reset_flag {
            trace!(%id, "dropping public reset for inactive connection");
            self.stats.packets_dropped += 1;
            return;
        }

        if self.time_wait.contains(id) {
            // Keep the entry's notion of the peer's version current so its
            // replies stay meaningful to the peer
            if let Some(declared) = header.version {
                self.time_wait.switch_version(id, declared);
            }
            let packet_number = header.packet_number.unwrap_or_default();
            if self.time_wait.process(id, packet_number, server_addr, client_addr) {
                self.register_write_blocked(BlockedWriter::TimeWait);
            }
            return;
        }

        // Brand-new connection id from here on
        let mut version = self.config.preferred_version();
        match header.version {
            Some(declared) if !self.config.is_supported(declared) => {
                trace!(%id, version = declared, "unsupported version; negotiating");
                let queued = self.time_wait.send_version_negotiation(
                    id,
                    &self.config.supported_versions,
                    server_addr,
                    client_addr,
                );
                if queued {
                    self.register_write_blocked(BlockedWriter::TimeWait);
                }
                self.stats.version_negotiations_sent += 1;
                return;
            }
            Some(declared) => version = declared,
            // First-contact packets may omit the version; assume ours
            None => {}
        }

        let datagram = Datagram {
            contents: data,
            server_addr,
            client_addr,
        };

        // While this id's admission decision is in flight, keep ordering by
        // parking everything else it sends
        if self.outstanding_decisions.contains_key(&id) {
            self.buffer_early_packet(now, id, datagram, false, version);
            return;
        }

        let packet_number = header.packet_number.unwrap_or_default();
        let fate = validity_checks(&header);
        self.process_first_contact(now, fate, id, version, packet_number, header.header_len, datagram);
    }

    /// A session reported closure out-of-band
    ///
    /// Detaches the session, moves its id into time-wait (replaying any
    /// termination packets the session produced), and defers the final drop
    /// to the next timeout tick. A closure for an id that is not in the
    /// session table indicates a driver bug; it is logged at error level and
    /// otherwise swallowed so the remaining connections keep being served.
    pub fn on_connection_closed(
        &mut self,
        now: Instant,
        id: ConnectionId,
        error_code: ErrorCode,
        closed_statelessly: bool,
    ) {
        self.detach_session(now, id, error_code, closed_statelessly);
    }

    /// A deferred admission decision arrived from the verifier
    ///
    /// Decisions for ids that have since been admitted, expired, or moved to
    /// time-wait are discarded as no-ops.
    pub fn on_admission_decision(
        &mut self,
        now: Instant,
        id: ConnectionId,
        decision: AdmissionDecision,
    ) {
        let outstanding = match self.outstanding_decisions.remove(&id) {
            Some(outstanding) => outstanding,
            None => {
                debug!(%id, "discarding admission decision for unknown connection");
                return;
            }
        };
        if self.sessions.contains_key(&id) || self.time_wait.contains(id) {
            debug!(%id, "discarding admission decision; connection already resolved");
            return;
        }
        self.apply_admission_decision(
            now,
            id,
            outstanding.version,
            outstanding.packet_number,
            outstanding.server_addr,
            outstanding.client_addr,
            None,
            decision,
        );
    }

    /// The shared writer transitioned from blocked to writable
    ///
    /// Gives every blocked writer one chance to write, in the order they
    /// blocked, stopping the instant the writer blocks again.
    pub fn on_can_write(&mut self, now: Instant) {
        self.writer.borrow_mut().set_writable();
        trace!(waiting = self.write_blocked.len(), "shared writer became writable");

        loop {
            if self.write_blocked.is_empty() || self.writer.borrow().is_blocked() {
                break;
            }
            let blocked = match self.write_blocked.pop_front() {
                Some(blocked) => blocked,
                None => break,
            };
            match blocked {
                BlockedWriter::TimeWait => {
                    if !self.time_wait.on_can_write() {
                        self.write_blocked.insert(BlockedWriter::TimeWait);
                    }
                }
                BlockedWriter::Session(id) => {
                    let signal = match self.sessions.get_mut(&id) {
                        Some(entry) => entry.session.on_can_write(),
                        None => continue,
                    };
                    self.handle_session_signal(now, id, signal);
                }
            }
        }
    }

    /// The next instant at which [`handle_timeout`](Self::handle_timeout)
    /// wants to run
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut deadline = self.delete_sessions_at;
        for candidate in [self.time_wait.next_cleanup_at(), self.buffered.next_expiry_at()] {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        deadline
    }

    /// Run maintenance due at or before `now`: reclaim detached sessions,
    /// retire expired time-wait entries, and write off buffered connections
    /// whose setup packet never arrived
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.delete_sessions_at.is_some_and(|at| at <= now) {
            self.delete_sessions_at = None;
            self.closed_sessions.clear();
        }
        for id in self.time_wait.cleanup_expired(now) {
            trace!(%id, "connection removed from time-wait list");
        }
        for (id, version) in self.buffered.expire_before(now) {
            debug!(%id, "buffered connection timed out before its setup packet arrived");
            self.add_to_time_wait(now, id, version, false, Vec::new());
        }
    }

    /// Reset this event-loop pass's session budget to `max_sessions_to_create`
    /// and admit that many buffered connections whose setup packet is waiting
    ///
    /// Once the budget is spent, further setup packets arriving through
    /// `ingest` are buffered instead of admitted, until the next call resets
    /// the budget. Drivers that do not need to bound session creation per
    /// pass never call this and get unlimited admission.
    pub fn process_buffered_setups(&mut self, now: Instant, max_sessions_to_create: usize) {
        self.new_sessions_allowed = Some(max_sessions_to_create);
        while self.new_sessions_allowed.is_some_and(|n| n > 0) {
            if self.sessions.len() >= self.config.max_sessions {
                break;
            }
            let (id, version, setup, packets) = match self.buffered.deliver_next_ready() {
                Some(ready) => ready,
                None => break,
            };
            self.create_and_replay(now, id, version, setup, packets);
        }
    }

    /// Whether any buffered connection is waiting only on the session budget
    pub fn has_buffered_setups(&self) -> bool {
        self.buffered.has_any_setup_buffered()
    }

    /// Close every live session and reclaim immediately
    pub fn shutdown(&mut self, now: Instant) {
        let ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.close(ErrorCode::PEER_GOING_AWAY, "server shutting down");
            }
            self.detach_session(now, id, ErrorCode::PEER_GOING_AWAY, false);
        }
        self.closed_sessions.clear();
        self.delete_sessions_at = None;
    }

    /// Number of live sessions
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Number of connection ids currently in time-wait
    pub fn num_time_wait_entries(&self) -> usize {
        self.time_wait.len()
    }

    /// Number of not-yet-admitted connection ids with buffered packets
    pub fn num_buffered_connections(&self) -> usize {
        self.buffered.len()
    }

    /// Whether any entity is waiting for the writer to become usable
    pub fn has_pending_writes(&self) -> bool {
        !self.write_blocked.is_empty() || self.time_wait.has_pending_writes()
    }

    /// Dispatch counters since construction
    pub fn stats(&self) -> DispatchStats {
        let mut stats = self.stats;
        stats.public_resets_sent = self.time_wait.resets_sent();
        stats
    }

    fn process_first_contact(
        &mut self,
        now: Instant,
        fate: PacketFate,
        id: ConnectionId,
        version: Version,
        packet_number: u64,
        header_len: usize,
        datagram: Datagram,
    ) {
        match fate {
            PacketFate::Process => {
                self.maybe_reject_statelessly(now, id, version, packet_number, header_len, datagram)
            }
            PacketFate::TimeWait => {
                if !self.time_wait.contains(id) {
                    self.add_to_time_wait(now, id, version, false, Vec::new());
                }
                if self
                    .time_wait
                    .process(id, packet_number, datagram.server_addr, datagram.client_addr)
                {
                    self.register_write_blocked(BlockedWriter::TimeWait);
                }
            }
            PacketFate::Buffer => self.buffer_early_packet(now, id, datagram, false, version),
        }
    }

    /// Decide whether a would-be connection gets a session, a stateless
    /// reject, or a stateless close, without allocating connection state until
    /// the outcome is known
    fn maybe_reject_statelessly(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        packet_number: u64,
        header_len: usize,
        datagram: Datagram,
    ) {
        let payload = datagram.contents.slice(header_len..);
        let hello = match ClientHello::extract(&payload) {
            Some(hello) => hello,
            None => {
                // Not a setup packet; it arrived ahead of one
                return self.process_first_contact(
                    now,
                    PacketFate::Buffer,
                    id,
                    version,
                    packet_number,
                    header_len,
                    datagram,
                );
            }
        };

        // Only one setup packet is tracked per connection
        if self.buffered.has_setup_buffered(id) {
            return self.buffer_early_packet(now, id, datagram, false, version);
        }

        if !self.config.stateless_rejects_enabled
            || !self.policy.should_attempt_stateless_reject()
        {
            return self.admit(now, id, version, packet_number, Some(datagram));
        }

        if let Err(details) = self.policy.can_accept(&hello, datagram.server_addr) {
            debug!(%id, "connection refused by admission policy: {details}");
            let (server_addr, client_addr) = (datagram.server_addr, datagram.client_addr);
            self.statelessly_close(
                now,
                id,
                version,
                ErrorCode::HANDSHAKE_FAILED,
                &details,
                packet_number,
                server_addr,
                client_addr,
            );
            return;
        }

        match self
            .verifier
            .evaluate(&hello, id, version, datagram.server_addr, datagram.client_addr)
        {
            Evaluation::Ready(decision) => {
                let (server_addr, client_addr) = (datagram.server_addr, datagram.client_addr);
                self.apply_admission_decision(
                    now,
                    id,
                    version,
                    packet_number,
                    server_addr,
                    client_addr,
                    Some(datagram),
                    decision,
                );
            }
            Evaluation::Pending => {
                trace!(%id, "admission decision deferred");
                let (server_addr, client_addr) = (datagram.server_addr, datagram.client_addr);
                self.buffer_early_packet(now, id, datagram, true, version);
                self.outstanding_decisions.insert(
                    id,
                    OutstandingDecision {
                        version,
                        packet_number,
                        server_addr,
                        client_addr,
                    },
                );
            }
        }
    }

    fn apply_admission_decision(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        packet_number: u64,
        server_addr: SocketAddr,
        client_addr: SocketAddr,
        setup: Option<Datagram>,
        decision: AdmissionDecision,
    ) {
        match decision {
            AdmissionDecision::Accept | AdmissionDecision::Unsupported => {
                self.admit(now, id, version, packet_number, setup);
            }
            AdmissionDecision::Reject(reply) => {
                debug!(%id, "connection rejected statelessly");
                self.buffered.discard(id);
                let packets = packet::build_handshake_packets(id, &reply);
                self.add_to_time_wait(now, id, version, true, packets);
                self.stats.stateless_rejects += 1;
                if self.time_wait.process(id, packet_number, server_addr, client_addr) {
                    self.register_write_blocked(BlockedWriter::TimeWait);
                }
            }
            AdmissionDecision::Fail(error_code, details) => {
                debug!(%id, %error_code, "client hello could not be processed: {details}");
                self.statelessly_close(
                    now,
                    id,
                    version,
                    error_code,
                    &details,
                    packet_number,
                    server_addr,
                    client_addr,
                );
            }
        }
    }

    /// Create the session for an admitted connection and replay everything
    /// waiting for it: the setup packet first, then early arrivals in order
    fn admit(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        packet_number: u64,
        setup: Option<Datagram>,
    ) {
        if self.new_sessions_allowed == Some(0) {
            // Out of session budget for this pass; hold the setup packet for
            // process_buffered_setups
            if let Some(setup) = setup {
                trace!(%id, "session budget exhausted; buffering setup packet");
                self.buffer_early_packet(now, id, setup, true, version);
            }
            return;
        }

        let (stored_setup, packets) = match self.buffered.deliver(id) {
            Some((_, stored_setup, packets)) => (stored_setup, packets),
            None => (None, Vec::new()),
        };
        let setup = match setup.or(stored_setup) {
            Some(setup) => setup,
            None => {
                debug!(%id, "no setup packet available; dropping admission");
                return;
            }
        };

        if self.sessions.len() >= self.config.max_sessions {
            debug!(%id, "refusing connection: session table full");
            let (server_addr, client_addr) = (setup.server_addr, setup.client_addr);
            self.statelessly_close(
                now,
                id,
                version,
                ErrorCode::SERVER_BUSY,
                "too many open connections",
                packet_number,
                server_addr,
                client_addr,
            );
            return;
        }

        self.create_and_replay(now, id, version, setup, packets);
    }

    fn create_and_replay(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        setup: Datagram,
        packets: Vec<Datagram>,
    ) {
        debug_assert!(!self.sessions.contains_key(&id));
        debug_assert!(!self.time_wait.contains(id));
        debug_assert!(!self.buffered.has_buffered(id));

        let session = match self
            .factory
            .create_session(id, setup.client_addr, self.writer.clone())
        {
            Some(session) => session,
            None => {
                debug!(%id, "failed to create session");
                self.stats.packets_dropped += 1;
                return;
            }
        };
        debug!(%id, "created new session");
        self.sessions.insert(id, SessionEntry { session, version });
        self.stats.sessions_created += 1;
        if let Some(allowed) = &mut self.new_sessions_allowed {
            *allowed -= 1;
        }

        if !self.deliver_to_session(now, id, setup) {
            return;
        }
        for datagram in packets {
            if !self.deliver_to_session(now, id, datagram) {
                break;
            }
        }
    }

    /// Synthesize a close for a connection that never gets a session and
    /// answer the inciting packet from time-wait
    fn statelessly_close(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        error_code: ErrorCode,
        reason: &str,
        packet_number: u64,
        server_addr: SocketAddr,
        client_addr: SocketAddr,
    ) {
        self.buffered.discard(id);
        let close = packet::build_data_packet(
            id,
            None,
            1,
            &packet::build_close_payload(error_code.0, reason),
        );
        self.add_to_time_wait(now, id, version, false, vec![close]);
        self.stats.stateless_closes += 1;
        if self.time_wait.process(id, packet_number, server_addr, client_addr) {
            self.register_write_blocked(BlockedWriter::TimeWait);
        }
    }

    /// Move an id into time-wait, upholding the rule that an id lives in at
    /// most one of the session table, the buffered store, and time-wait
    fn add_to_time_wait(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        statelessly_rejected: bool,
        termination_packets: Vec<Bytes>,
    ) {
        debug_assert!(!self.sessions.contains_key(&id));
        self.buffered.discard(id);
        self.outstanding_decisions.remove(&id);
        debug!(%id, "connection added to time-wait list");
        for evicted in
            self.time_wait
                .add(now, id, version, statelessly_rejected, termination_packets)
        {
            trace!(id = %evicted, "connection removed from time-wait list");
        }
    }

    fn buffer_early_packet(
        &mut self,
        now: Instant,
        id: ConnectionId,
        datagram: Datagram,
        is_setup: bool,
        version: Version,
    ) {
        let is_new = !self.buffered.has_buffered(id);
        match self.buffered.enqueue(now, id, datagram, is_setup, version) {
            EnqueueResult::Success => {
                self.stats.packets_buffered += 1;
                if is_new {
                    debug!(%id, "buffering packets for new connection");
                }
            }
            result => {
                debug!(%id, ?result, "failed to buffer packet");
                self.stats.packets_dropped += 1;
            }
        }
    }

    /// Returns whether the session is still live afterwards
    fn deliver_to_session(&mut self, now: Instant, id: ConnectionId, datagram: Datagram) -> bool {
        let signal = match self.sessions.get_mut(&id) {
            Some(entry) => entry.session.deliver(now, datagram),
            None => return false,
        };
        self.handle_session_signal(now, id, signal)
    }

    fn handle_session_signal(
        &mut self,
        now: Instant,
        id: ConnectionId,
        signal: SessionSignal,
    ) -> bool {
        match signal {
            SessionSignal::Continue => true,
            SessionSignal::Blocked => {
                self.register_write_blocked(BlockedWriter::Session(id));
                true
            }
            SessionSignal::Closed {
                error_code,
                closed_statelessly,
            } => {
                self.detach_session(now, id, error_code, closed_statelessly);
                false
            }
        }
    }

    fn detach_session(
        &mut self,
        now: Instant,
        id: ConnectionId,
        error_code: ErrorCode,
        closed_statelessly: bool,
    ) {
        let mut entry = match self.sessions.remove(&id) {
            Some(entry) => entry,
            None => {
                error!(%id, %error_code, "connection closed for id missing from the session table");
                return;
            }
        };
        if error_code != ErrorCode::NO_ERROR {
            debug!(%id, %error_code, "closing connection due to error");
        }
        self.write_blocked.remove(&BlockedWriter::Session(id));
        let termination_packets = entry.session.take_termination_packets();
        debug_assert!(!closed_statelessly || !termination_packets.is_empty());
        self.add_to_time_wait(now, id, entry.version, closed_statelessly, termination_packets);
        if self.closed_sessions.is_empty() {
            // First closure since the last reclaim: request an immediate tick
            self.delete_sessions_at = Some(now);
        }
        self.closed_sessions.push(entry.session);
        self.stats.sessions_closed += 1;
    }

    fn register_write_blocked(&mut self, blocked: BlockedWriter) {
        if !self.writer.borrow().is_blocked() {
            // Registering while writable would spin the next drain forever
            error!("write blocked reported while the shared writer is writable");
            return;
        }
        self.write_blocked.insert(blocked);
    }
}

/// Apply the validity checks to a first-contact header and pick its fate
///
/// Checks must stay grouped by the fate they produce, highest-priority fate
/// first.
fn validity_checks(header: &PublicHeader) -> PacketFate {
    // Checks that return PacketFate::TimeWait.

    // Every packet a client sends before hearing from the server declares a
    // version. One that does not is likely a continuation of a connection
    // this server lost across a restart; bounce it to fast-fail the peer.
    if !header.version_flag {
        return PacketFate::TimeWait;
    }

    // First-contact packet numbers start small; zero or implausibly large
    // means a stray or crafted packet
    match header.packet_number {
        Some(n) if n != 0 && n <= MAX_REASONABLE_INITIAL_PACKET_NUMBER => PacketFate::Process,
        _ => PacketFate::TimeWait,
    }
}
