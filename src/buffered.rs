//! Buffering of datagrams that outran their connection's setup packet
//!
//! Reordering and multi-packet handshakes mean data can arrive for a
//! connection the dispatcher has not admitted yet. Those datagrams wait here,
//! bounded two ways so that spoofed floods cannot grow the working set: a cap
//! on distinct IDs tracked at once and a cap on datagrams per ID.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::shared::{ConnectionId, Datagram, Version};

/// Outcome of trying to buffer one datagram
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EnqueueResult {
    Success,
    /// The store already tracks the maximum number of distinct IDs
    TooManyConnections,
    /// This ID already holds the maximum number of buffered datagrams
    TooManyPackets,
}

struct BufferedList {
    /// The setup packet, held apart because it must reach the session first
    setup: Option<Datagram>,
    /// Early arrivals in arrival order
    packets: VecDeque<Datagram>,
    /// Version from the first packet seen for this ID, used when the ID is
    /// written off into time-wait
    version: Version,
    created: Instant,
}

impl BufferedList {
    fn total(&self) -> usize {
        self.packets.len() + usize::from(self.setup.is_some())
    }
}

pub(crate) struct BufferedPacketStore {
    connections: FxHashMap<ConnectionId, BufferedList>,
    /// IDs in creation order, oldest first, for grace-period expiry
    creation_order: VecDeque<(ConnectionId, Instant)>,
    /// IDs in the order their setup packet arrived
    setup_order: VecDeque<ConnectionId>,
    max_connections: usize,
    max_packets_per_connection: usize,
    grace_period: Duration,
}

impl BufferedPacketStore {
    pub(crate) fn new(
        max_connections: usize,
        max_packets_per_connection: usize,
        grace_period: Duration,
    ) -> Self {
        Self {
            connections: FxHashMap::default(),
            creation_order: VecDeque::new(),
            setup_order: VecDeque::new(),
            max_connections,
            max_packets_per_connection,
            grace_period,
        }
    }

    /// Buffer one datagram for a not-yet-admitted connection
    pub(crate) fn enqueue(
        &mut self,
        now: Instant,
        id: ConnectionId,
        datagram: Datagram,
        is_setup: bool,
        version: Version,
    ) -> EnqueueResult {
        if !self.connections.contains_key(&id) {
            if self.connections.len() >= self.max_connections {
                return EnqueueResult::TooManyConnections;
            }
            self.connections.insert(
                id,
                BufferedList {
                    setup: None,
                    packets: VecDeque::new(),
                    version,
                    created: now,
                },
            );
            self.creation_order.push_back((id, now));
        }
        let list = self.connections.get_mut(&id).unwrap();
        if list.total() >= self.max_packets_per_connection {
            return EnqueueResult::TooManyPackets;
        }
        if is_setup {
            // At most one setup packet is tracked per ID
            debug_assert!(list.setup.is_none());
            list.setup = Some(datagram);
            self.setup_order.push_back(id);
        } else {
            list.packets.push_back(datagram);
        }
        EnqueueResult::Success
    }

    pub(crate) fn has_buffered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub(crate) fn has_setup_buffered(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|list| list.setup.is_some())
    }

    pub(crate) fn has_any_setup_buffered(&self) -> bool {
        !self.setup_order.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Surrender everything buffered for `id`: the setup packet, if any, and
    /// the early arrivals in arrival order
    pub(crate) fn deliver(
        &mut self,
        id: ConnectionId,
    ) -> Option<(Version, Option<Datagram>, Vec<Datagram>)> {
        let list = self.remove(id)?;
        Some((list.version, list.setup, list.packets.into()))
    }

    /// Forget everything buffered for `id`
    pub(crate) fn discard(&mut self, id: ConnectionId) {
        self.remove(id);
    }

    /// Surrender the buffered packets of the ID whose setup packet has waited
    /// longest, for bounded-rate session creation
    pub(crate) fn deliver_next_ready(
        &mut self,
    ) -> Option<(ConnectionId, Version, Datagram, Vec<Datagram>)> {
        let id = self.setup_order.front().copied()?;
        let (version, setup, packets) = self.deliver(id)?;
        Some((id, version, setup?, packets))
    }

    /// Drop the id's record, including its place in the setup queue
    fn remove(&mut self, id: ConnectionId) -> Option<BufferedList> {
        let list = self.connections.remove(&id)?;
        if list.setup.is_some() {
            self.setup_order.retain(|queued| *queued != id);
        }
        Some(list)
    }

    /// Write off IDs whose packets have waited out the grace period
    ///
    /// Their datagrams are discarded, not replayed; the caller folds the IDs
    /// into time-wait so further stray traffic gets answered.
    pub(crate) fn expire_before(&mut self, now: Instant) -> Vec<(ConnectionId, Version)> {
        let mut expired = Vec::new();
        while let Some(&(id, created)) = self.creation_order.front() {
            match self.connections.get(&id) {
                Some(list) if list.created == created => {
                    if now.duration_since(created) < self.grace_period {
                        break;
                    }
                    trace!(%id, "expiring buffered packets that never completed setup");
                    expired.push((id, list.version));
                    self.remove(id);
                    self.creation_order.pop_front();
                }
                // The ID was delivered or discarded since
                _ => {
                    self.creation_order.pop_front();
                }
            }
        }
        expired
    }

    /// When the oldest tracked ID will exhaust its grace period
    pub(crate) fn next_expiry_at(&self) -> Option<Instant> {
        self.creation_order
            .iter()
            .find(|&&(id, created)| {
                self.connections
                    .get(&id)
                    .is_some_and(|list| list.created == created)
            })
            .map(|&(_, created)| created + self.grace_period)
    }
}
