//! Tracking of recently-terminated connection IDs
//!
//! A terminated connection's ID keeps answering stray traffic for a fixed
//! period so that a peer which missed the termination learns about it instead
//! of retransmitting into a void. Replies are throttled exponentially to keep
//! the list from being usable as an amplification reflector.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::packet;
use crate::shared::{ConnectionId, Version};
use crate::writer::{SharedWriter, WriteResult};

struct TimeWaitEntry {
    version: Version,
    /// Datagrams received for this ID since it entered time-wait; survives
    /// re-insertion so the reply throttle cannot be reset by re-closing
    num_packets: u64,
    statelessly_rejected: bool,
    /// Termination datagram(s) replayed verbatim in place of a public reset
    termination_packets: Vec<Bytes>,
    inserted: Instant,
}

/// A reply that could not be sent while the shared writer was blocked
struct QueuedPacket {
    owner: ConnectionId,
    contents: Bytes,
    server_addr: SocketAddr,
    client_addr: SocketAddr,
}

pub(crate) struct TimeWaitList {
    entries: FxHashMap<ConnectionId, TimeWaitEntry>,
    /// Insertion order, oldest first; stale pairs (from re-insertion or early
    /// eviction) are recognized by their mismatched timestamp and skipped
    expiry_order: VecDeque<(ConnectionId, Instant)>,
    pending_writes: VecDeque<QueuedPacket>,
    writer: SharedWriter,
    time_wait_duration: Duration,
    max_entries: usize,
    nonce_seed: u64,
    resets_sent: u64,
}

impl TimeWaitList {
    pub(crate) fn new(
        time_wait_duration: Duration,
        max_entries: usize,
        writer: SharedWriter,
        nonce_seed: u64,
    ) -> Self {
        Self {
            entries: FxHashMap::default(),
            expiry_order: VecDeque::new(),
            pending_writes: VecDeque::new(),
            writer,
            time_wait_duration,
            max_entries,
            nonce_seed,
            resets_sent: 0,
        }
    }

    /// Start (or restart) the time-wait period for `id`
    ///
    /// Re-inserting an ID that is already present replaces its entry but keeps
    /// the received-packet counter. Returns IDs evicted early to stay within
    /// capacity.
    pub(crate) fn add(
        &mut self,
        now: Instant,
        id: ConnectionId,
        version: Version,
        statelessly_rejected: bool,
        termination_packets: Vec<Bytes>,
    ) -> Vec<ConnectionId> {
        let mut num_packets = 0;
        if let Some(old) = self.entries.remove(&id) {
            trace!(%id, "replacing time-wait entry");
            num_packets = old.num_packets;
        }
        let mut evicted = Vec::new();
        while self.entries.len() >= self.max_entries {
            match self.evict_oldest() {
                Some(id) => evicted.push(id),
                None => break,
            }
        }
        self.entries.insert(
            id,
            TimeWaitEntry {
                version,
                num_packets,
                statelessly_rejected,
                termination_packets,
                inserted: now,
            },
        );
        self.expiry_order.push_back((id, now));
        evicted
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Update the version remembered for an id already in time-wait
    pub(crate) fn switch_version(&mut self, id: ConnectionId, version: Version) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.version = version;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    pub(crate) fn resets_sent(&self) -> u64 {
        self.resets_sent
    }

    /// Handle a datagram received for an ID in time-wait
    ///
    /// Replies only when the received-packet count reaches a power of two,
    /// replaying the cached termination packets if any and synthesizing a
    /// public reset otherwise. Returns whether replies were queued behind a
    /// blocked writer, in which case the caller must register this list for
    /// the next writable event.
    pub(crate) fn process(
        &mut self,
        id: ConnectionId,
        packet_number: u64,
        server_addr: SocketAddr,
        client_addr: SocketAddr,
    ) -> bool {
        let (count, version, termination_packets) = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.num_packets += 1;
                if !should_respond(entry.num_packets) {
                    return false;
                }
                (entry.num_packets, entry.version, entry.termination_packets.clone())
            }
            None => {
                debug_assert!(false, "processed packet for id not in time-wait");
                return false;
            }
        };
        trace!(%id, count, version, "answering packet for connection in time-wait");
        let mut queued = false;
        if termination_packets.is_empty() {
            let reset =
                packet::build_public_reset(id, nonce_proof(self.nonce_seed, id), packet_number);
            self.resets_sent += 1;
            queued |= !self.send_or_queue(QueuedPacket {
                owner: id,
                contents: reset,
                server_addr,
                client_addr,
            });
        } else {
            for contents in termination_packets {
                queued |= !self.send_or_queue(QueuedPacket {
                    owner: id,
                    contents,
                    server_addr,
                    client_addr,
                });
            }
        }
        queued
    }

    /// Answer an unsupported declared version with the list of versions we do
    /// speak. Returns whether the reply was queued behind a blocked writer.
    pub(crate) fn send_version_negotiation(
        &mut self,
        id: ConnectionId,
        versions: &[Version],
        server_addr: SocketAddr,
        client_addr: SocketAddr,
    ) -> bool {
        trace!(%id, "sending version negotiation");
        !self.send_or_queue(QueuedPacket {
            owner: id,
            contents: packet::build_version_negotiation(id, versions),
            server_addr,
            client_addr,
        })
    }

    /// Flush replies queued while the writer was blocked, oldest first
    ///
    /// Returns `false` if the writer blocked again mid-drain and this list
    /// must be re-registered for the next writable event.
    pub(crate) fn on_can_write(&mut self) -> bool {
        while let Some(queued) = self.pending_writes.front() {
            let result = self.writer.borrow_mut().write(
                &queued.contents,
                queued.server_addr,
                queued.client_addr,
            );
            match result {
                WriteResult::Sent => {
                    self.pending_writes.pop_front();
                }
                WriteResult::Blocked => return false,
                WriteResult::Error(e) => {
                    warn!(client = %queued.client_addr, "failed to send time-wait reply: {e}");
                    self.pending_writes.pop_front();
                }
            }
        }
        true
    }

    /// Retire entries that have outlived the time-wait period, oldest first
    pub(crate) fn cleanup_expired(&mut self, now: Instant) -> Vec<ConnectionId> {
        let mut expired = Vec::new();
        while let Some(&(id, inserted)) = self.expiry_order.front() {
            match self.entries.get(&id) {
                Some(entry) if entry.inserted == inserted => {
                    if now.duration_since(inserted) < self.time_wait_duration {
                        break;
                    }
                    self.remove_entry(id);
                    expired.push(id);
                }
                // Stale order pair left behind by re-insertion or eviction
                _ => {
                    self.expiry_order.pop_front();
                }
            }
        }
        expired
    }

    /// When the oldest entry will be due for cleanup
    pub(crate) fn next_cleanup_at(&self) -> Option<Instant> {
        self.expiry_order
            .iter()
            .find(|&&(id, inserted)| {
                self.entries
                    .get(&id)
                    .is_some_and(|entry| entry.inserted == inserted)
            })
            .map(|&(_, inserted)| inserted + self.time_wait_duration)
    }

    fn evict_oldest(&mut self) -> Option<ConnectionId> {
        while let Some(&(id, inserted)) = self.expiry_order.front() {
            match self.entries.get(&id) {
                Some(entry) if entry.inserted == inserted => {
                    warn!(%id, "evicting time-wait entry early to stay within capacity");
                    self.remove_entry(id);
                    return Some(id);
                }
                _ => {
                    self.expiry_order.pop_front();
                }
            }
        }
        None
    }

    fn remove_entry(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.remove(&id) {
            if entry.statelessly_rejected {
                debug!(%id, "statelessly rejected connection left time-wait");
            }
        }
        self.expiry_order.pop_front();
        // Replies owned by a retired entry are no longer worth sending
        self.pending_writes.retain(|queued| queued.owner != id);
    }

    /// Send immediately when possible; queue when the writer is blocked.
    /// Returns whether the packet was handed to the socket.
    fn send_or_queue(&mut self, queued: QueuedPacket) -> bool {
        let mut writer = self.writer.borrow_mut();
        if writer.is_blocked() {
            drop(writer);
            self.pending_writes.push_back(queued);
            return false;
        }
        match writer.write(&queued.contents, queued.server_addr, queued.client_addr) {
            WriteResult::Sent => true,
            WriteResult::Blocked => {
                drop(writer);
                self.pending_writes.push_back(queued);
                false
            }
            WriteResult::Error(e) => {
                warn!(client = %queued.client_addr, "failed to send time-wait reply: {e}");
                true
            }
        }
    }
}

/// Reply to the 1st, 2nd, 4th, 8th... packet only, bounding the amplification
/// an attacker gets from probing a dead connection ID
fn should_respond(received_packet_count: u64) -> bool {
    received_packet_count & (received_packet_count - 1) == 0
}

/// Deterministic per-ID nonce proof, so repeated probes for one ID elicit
/// byte-identical resets
fn nonce_proof(seed: u64, id: ConnectionId) -> u64 {
    let mut x = seed ^ id.to_u64();
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ x >> 31
}
