use std::net::SocketAddr;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use crate::shared::DEFAULT_SUPPORTED_VERSIONS;
use crate::{
    AdmissionDecision, ConnectionId, DispatchConfig, ErrorCode, Evaluation, PublicHeader,
    SessionSignal,
};

use util::*;

const VERSION: u32 = DEFAULT_SUPPORTED_VERSIONS[0];

#[test]
fn session_created_and_packets_routed_in_order() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(1);
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    d.ingest(data_packet(id, VERSION, 2, b"second"));
    d.ingest(data_packet(id, VERSION, 3, b"third"));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    let log = d.log.borrow();
    assert_eq!(log.deliveries.len(), 3);
    // Same session instance, original arrival order
    assert!(log.deliveries.iter().all(|&(seq, did, _)| seq == 0 && did == id));
    let stats = d.dispatcher.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.packets_ingested, 3);
}

#[test]
fn full_connection_lifecycle() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(0xfeed);

    // Fresh id with a valid minimal header creates a session
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    // An immediate second datagram reaches the same session
    d.ingest(data_packet(id, VERSION, 2, b"more"));
    assert_eq!(d.dispatcher.num_sessions(), 1);
    assert_eq!(d.log.borrow().deliveries.len(), 2);

    // Abrupt closure moves the id to time-wait with nothing cached
    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::INTERNAL_ERROR, false);
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);

    // Three probes: replies at received-packet counts 1 and 2, not 3
    d.drain_sent();
    for n in 4..=6u64 {
        d.ingest(data_packet(id, VERSION, n, b"probe"));
    }
    let sent = d.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| is_public_reset(p)));

    // The cleanup tick after the configured duration retires the entry
    d.advance(Duration::from_secs(5));
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);
}

#[test]
fn malformed_datagrams_leave_no_trace() {
    let mut d = TestDispatch::default();

    // Wrong id length class (no connection id at all)
    let mut no_id = vec![0x01u8];
    no_id.extend_from_slice(&VERSION.to_be_bytes());
    no_id.push(1);
    d.ingest(Bytes::from(no_id));

    // Truncated header
    d.ingest(Bytes::from_static(&[0x09, 0x11, 0x22]));

    // Empty datagram
    d.ingest(Bytes::new());

    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);
    assert!(d.sent().is_empty());
    assert_eq!(d.dispatcher.stats().packets_dropped, 3);
}

#[test]
fn zero_source_port_is_dropped() {
    let mut d = TestDispatch::default();
    let from = SocketAddr::from(([127, 0, 0, 1], 0));
    d.ingest_from(from, setup_packet(ConnectionId::from(1), VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert!(d.sent().is_empty());
    assert_eq!(d.dispatcher.stats().packets_dropped, 1);
}

#[test]
fn unsolicited_reset_for_unknown_id_is_dropped() {
    let mut d = TestDispatch::default();
    d.ingest(crate::packet::build_public_reset(ConnectionId::from(3), 7, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);
    assert!(d.sent().is_empty());
}

#[test]
fn reset_for_id_in_time_wait_gets_no_reply() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(4);
    d.ingest(setup_packet(id, VERSION, 1));
    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::NO_ERROR, false);
    d.drain_sent();

    d.ingest(crate::packet::build_public_reset(id, 7, 1));
    assert!(d.sent().is_empty());
    // The probe did not advance the reply throttle either
    d.ingest(data_packet(id, VERSION, 2, b"probe"));
    assert_eq!(d.sent().len(), 1);
}

#[test]
fn unsupported_version_gets_negotiation() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(5);
    d.ingest(setup_packet(id, 0xdead_beef, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);

    let sent = d.sent();
    assert_eq!(sent.len(), 1);
    // flags: version + connection id, then the id, then the version list
    assert_eq!(sent[0][0], 0x01 | 0x08);
    assert_eq!(&sent[0][1..9], id.as_bytes());
    let versions: Vec<u32> = sent[0][9..]
        .chunks(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(versions, DEFAULT_SUPPORTED_VERSIONS);
    assert_eq!(d.dispatcher.stats().version_negotiations_sent, 1);
}

#[test]
fn missing_version_flag_goes_to_time_wait() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(7);
    d.ingest(no_version_packet(id, 9));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);
    // First packet for the new entry is answered with a public reset
    let sent = d.sent();
    assert_eq!(sent.len(), 1);
    assert_matches!(
        PublicHeader::decode(&sent[0]),
        Ok(PublicHeader {
            reset_flag: true,
            ..
        })
    );
    assert_eq!(d.dispatcher.stats().public_resets_sent, 1);

    // Even a well-formed setup payload is blackholed without the flag
    let id = ConnectionId::from(6);
    d.ingest(crate::packet::build_data_packet(
        id,
        None,
        1,
        &client_hello_payload(b""),
    ));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 2);
}

#[test]
fn implausible_packet_numbers_go_to_time_wait() {
    let mut d = TestDispatch::default();
    d.ingest(setup_packet(ConnectionId::from(8), VERSION, 0));
    d.ingest(setup_packet(ConnectionId::from(9), VERSION, 101));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 2);
    // The largest plausible packet number still creates a session
    d.ingest(setup_packet(ConnectionId::from(10), VERSION, 100));
    assert_eq!(d.dispatcher.num_sessions(), 1);
}

#[test]
fn early_packets_replayed_after_setup() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(11);
    d.ingest(data_packet(id, VERSION, 2, b"early-1"));
    d.ingest(data_packet(id, VERSION, 3, b"early-2"));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_buffered_connections(), 1);
    assert_eq!(d.dispatcher.stats().packets_buffered, 2);

    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);
    assert_eq!(d.dispatcher.num_buffered_connections(), 0);

    // Setup first, then early arrivals in their original order
    let log = d.log.borrow();
    assert_eq!(log.deliveries.len(), 3);
    assert!(log.deliveries.iter().all(|&(seq, _, _)| seq == 0));
    let setup_contents = &log.deliveries[0].2;
    assert!(crate::ClientHello::extract(
        &setup_contents[PublicHeader::decode(setup_contents).unwrap().header_len..]
    )
    .is_some());
    assert_eq!(&log.deliveries[1].2[..], &data_packet(id, VERSION, 2, b"early-1")[..]);
    assert_eq!(&log.deliveries[2].2[..], &data_packet(id, VERSION, 3, b"early-2")[..]);
}

#[test]
fn buffered_connection_caps_drop_overflow() {
    let mut config = DispatchConfig::default();
    config
        .max_buffered_connections(2)
        .max_buffered_packets_per_connection(2);
    let mut d = TestDispatch::new(config);

    d.ingest(data_packet(ConnectionId::from(1), VERSION, 2, b"a"));
    d.ingest(data_packet(ConnectionId::from(2), VERSION, 2, b"b"));
    // Third distinct unestablished id is refused
    d.ingest(data_packet(ConnectionId::from(3), VERSION, 2, b"c"));
    // Per-id cap: third packet for id 1 is refused
    d.ingest(data_packet(ConnectionId::from(1), VERSION, 3, b"d"));
    d.ingest(data_packet(ConnectionId::from(1), VERSION, 4, b"e"));

    let stats = d.dispatcher.stats();
    assert_eq!(stats.packets_buffered, 3);
    assert_eq!(stats.packets_dropped, 2);
}

#[test]
fn stale_buffered_connections_fold_into_time_wait() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(12);
    d.ingest(data_packet(id, VERSION, 2, b"early"));
    assert_eq!(d.dispatcher.num_sessions(), 0);

    d.advance(Duration::from_secs(5));
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);

    // A late setup packet is answered from time-wait, never replayed
    d.drain_sent();
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.sent().len(), 1);
    assert_eq!(d.log.borrow().deliveries.len(), 0);
}

#[test]
fn policy_rejection_sends_stateless_close() {
    let mut d = TestDispatch::default();
    *d.reject_with.borrow_mut() = Some("not today".into());
    let id = ConnectionId::from(13);
    d.ingest(setup_packet(id, VERSION, 1));

    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);
    let sent = d.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(payload_frame_type(&sent[0]), Some(0x02));
    assert_eq!(d.dispatcher.stats().stateless_closes, 1);
}

#[test]
fn crypto_rejection_replays_reject_packets() {
    let mut d = TestDispatch::default();
    let reply = Bytes::from_static(b"REJ: retry with this token");
    d.evaluations
        .borrow_mut()
        .push_back(Evaluation::Ready(AdmissionDecision::Reject(reply)));
    let id = ConnectionId::from(14);
    d.ingest(setup_packet(id, VERSION, 1));

    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);
    let sent = d.drain_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(payload_frame_type(&sent[0]), Some(0x01));
    assert_eq!(d.dispatcher.stats().stateless_rejects, 1);

    // Further probes replay the cached reject under the usual throttle
    d.ingest(data_packet(id, VERSION, 2, b"again"));
    assert_eq!(d.drain_sent(), vec![sent[0].clone()]);
}

#[test]
fn crypto_failure_sends_close_with_its_code() {
    let mut d = TestDispatch::default();
    d.evaluations
        .borrow_mut()
        .push_back(Evaluation::Ready(AdmissionDecision::Fail(
            ErrorCode::HANDSHAKE_FAILED,
            "unparseable hello".into(),
        )));
    let id = ConnectionId::from(15);
    d.ingest(setup_packet(id, VERSION, 1));

    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);
    let sent = d.sent();
    assert_eq!(sent.len(), 1);
    let header = PublicHeader::decode(&sent[0]).unwrap();
    let payload = &sent[0][header.header_len..];
    assert_eq!(payload[0], 0x02);
    assert_eq!(
        u32::from_be_bytes(payload[1..5].try_into().unwrap()),
        ErrorCode::HANDSHAKE_FAILED.0
    );
}

#[test]
fn disabled_stateless_rejects_skip_the_verifier() {
    let mut config = DispatchConfig::default();
    config.stateless_rejects_enabled(false);
    let mut d = TestDispatch::new(config);
    *d.reject_with.borrow_mut() = Some("would reject".into());

    d.ingest(setup_packet(ConnectionId::from(16), VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);
    assert!(d.verifier_seen.borrow().is_empty());
}

#[test]
fn deferred_decision_keeps_dispatcher_reentrant() {
    let mut d = TestDispatch::default();
    d.evaluations.borrow_mut().push_back(Evaluation::Pending);
    let (slow, fast) = (ConnectionId::from(17), ConnectionId::from(18));

    d.ingest(setup_packet(slow, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    // Packets for the undecided id are parked to preserve ordering
    d.ingest(data_packet(slow, VERSION, 2, b"while-pending"));

    // Other connection ids proceed in the interim
    d.ingest(setup_packet(fast, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    d.dispatcher
        .on_admission_decision(d.time, slow, AdmissionDecision::Accept);
    assert_eq!(d.dispatcher.num_sessions(), 2);

    // The slow id's session got its setup packet first, then the parked data
    let log = d.log.borrow();
    let slow_deliveries: Vec<_> = log
        .deliveries
        .iter()
        .filter(|&&(_, id, _)| id == slow)
        .collect();
    assert_eq!(slow_deliveries.len(), 2);
    assert_eq!(
        &slow_deliveries[1].2[..],
        &data_packet(slow, VERSION, 2, b"while-pending")[..]
    );
}

#[test]
fn decision_for_resolved_id_is_discarded() {
    let mut d = TestDispatch::default();
    d.evaluations.borrow_mut().push_back(Evaluation::Pending);
    let id = ConnectionId::from(19);
    d.ingest(setup_packet(id, VERSION, 1));

    // The grace period runs out before the verifier answers
    d.advance(Duration::from_secs(5));
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);

    d.dispatcher
        .on_admission_decision(d.time, id, AdmissionDecision::Accept);
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);

    // So is a decision for an id never seen at all
    d.dispatcher
        .on_admission_decision(d.time, ConnectionId::from(20), AdmissionDecision::Accept);
    assert_eq!(d.dispatcher.num_sessions(), 0);
}

#[test]
fn session_table_capacity_refuses_with_server_busy() {
    let mut config = DispatchConfig::default();
    config.max_sessions(1);
    let mut d = TestDispatch::new(config);

    d.ingest(setup_packet(ConnectionId::from(21), VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    d.ingest(setup_packet(ConnectionId::from(22), VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);
    let sent = d.sent();
    assert_eq!(sent.len(), 1);
    let header = PublicHeader::decode(&sent[0]).unwrap();
    let payload = &sent[0][header.header_len..];
    assert_eq!(payload[0], 0x02);
    assert_eq!(
        u32::from_be_bytes(payload[1..5].try_into().unwrap()),
        ErrorCode::SERVER_BUSY.0
    );
}

#[test]
fn failed_session_allocation_drops_without_state() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(23);
    d.script(id).fail_creation = true;
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);
    assert!(d.sent().is_empty());
    assert_eq!(d.dispatcher.stats().packets_dropped, 1);
}

#[test]
fn closure_for_unknown_id_is_swallowed() {
    let mut d = TestDispatch::default();
    d.dispatcher
        .on_connection_closed(d.time, ConnectionId::from(24), ErrorCode::NO_ERROR, false);
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);
    assert_eq!(d.dispatcher.stats().sessions_closed, 0);
}

#[test]
fn graceful_close_replays_termination_packets() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(25);
    let goodbye = Bytes::from_static(b"connection close frame");
    d.script(id).termination_packets = vec![goodbye.clone()];
    d.ingest(setup_packet(id, VERSION, 1));

    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::NO_ERROR, false);
    d.drain_sent();
    d.ingest(data_packet(id, VERSION, 2, b"missed it"));
    assert_eq!(d.drain_sent(), vec![goodbye]);
    assert_eq!(d.dispatcher.stats().public_resets_sent, 0);
}

#[test]
fn session_closing_inside_deliver_is_detached() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(26);
    d.script(id).signals.push_back(SessionSignal::Continue);
    d.script(id).signals.push_back(SessionSignal::Closed {
        error_code: ErrorCode::NETWORK_IDLE_TIMEOUT,
        closed_statelessly: false,
    });
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    d.ingest(data_packet(id, VERSION, 2, b"fatal"));
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 1);

    // Deferred reclaim happens on the zero-delay tick, not inside the call
    assert_eq!(d.dispatcher.poll_timeout(), Some(d.time));
    d.advance(Duration::from_millis(0));
    assert_eq!(d.dispatcher.stats().sessions_closed, 1);
}

#[test]
fn blocked_writers_drain_in_fifo_order() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(27);
    d.ingest(setup_packet(id, VERSION, 1));
    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::NO_ERROR, false);
    d.drain_sent();

    d.block_writer();
    d.ingest(data_packet(id, VERSION, 2, b"probe"));
    assert!(d.sent().is_empty());
    assert!(d.dispatcher.has_pending_writes());

    d.unblock_writer();
    assert_eq!(d.sent().len(), 1);
    assert!(is_public_reset(&d.sent()[0]));
    assert!(!d.dispatcher.has_pending_writes());
}

#[test]
fn drain_stops_when_writer_blocks_again() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(28);
    let (first, second) = (
        Bytes::from_static(b"close part 1"),
        Bytes::from_static(b"close part 2"),
    );
    d.script(id).termination_packets = vec![first.clone(), second.clone()];
    d.ingest(setup_packet(id, VERSION, 1));
    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::NO_ERROR, false);
    d.drain_sent();

    d.block_writer();
    d.ingest(data_packet(id, VERSION, 2, b"probe"));
    assert!(d.dispatcher.has_pending_writes());
    assert!(d.sent().is_empty());

    // The socket takes one datagram and blocks again mid-drain
    d.writer.borrow_mut().block_after = Some(1);
    d.unblock_writer();
    assert_eq!(d.drain_sent(), vec![first]);
    assert!(d.dispatcher.has_pending_writes());

    // The next writable event finishes the job
    d.unblock_writer();
    assert_eq!(d.drain_sent(), vec![second]);
    assert!(!d.dispatcher.has_pending_writes());
}

#[test]
fn session_budget_defers_admission() {
    let mut d = TestDispatch::default();
    let (a, b, c) = (
        ConnectionId::from(29),
        ConnectionId::from(30),
        ConnectionId::from(31),
    );

    // Spend the whole budget on one pass
    d.dispatcher.process_buffered_setups(d.time, 1);
    assert_eq!(d.dispatcher.num_sessions(), 0);

    d.ingest(setup_packet(a, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);

    // Budget exhausted: further setups are buffered, not admitted
    d.ingest(setup_packet(b, VERSION, 1));
    d.ingest(setup_packet(c, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);
    assert!(d.dispatcher.has_buffered_setups());

    // The next pass admits them in the order their setup packets arrived
    d.dispatcher.process_buffered_setups(d.time, 10);
    assert_eq!(d.dispatcher.num_sessions(), 3);
    assert!(!d.dispatcher.has_buffered_setups());
    let log = d.log.borrow();
    let order: Vec<ConnectionId> = log.deliveries.iter().map(|&(_, id, _)| id).collect();
    assert_eq!(order, vec![a, b, c]);
}

#[test]
fn shutdown_closes_every_session() {
    let mut d = TestDispatch::default();
    for n in 32..35u64 {
        d.ingest(setup_packet(ConnectionId::from(n), VERSION, 1));
    }
    assert_eq!(d.dispatcher.num_sessions(), 3);

    d.dispatcher.shutdown(d.time);
    assert_eq!(d.dispatcher.num_sessions(), 0);
    assert_eq!(d.dispatcher.num_time_wait_entries(), 3);
    let log = d.log.borrow();
    assert_eq!(log.closed.len(), 3);
    assert!(log
        .closed
        .iter()
        .all(|(_, code, _)| *code == ErrorCode::PEER_GOING_AWAY));
}

#[test]
fn expired_time_wait_id_starts_fresh() {
    let mut d = TestDispatch::default();
    let id = ConnectionId::from(35);
    d.ingest(setup_packet(id, VERSION, 1));
    d.dispatcher
        .on_connection_closed(d.time, id, ErrorCode::NO_ERROR, false);
    d.drain_sent();

    // Probes keep being answered until the entry expires, then a fresh id
    // history begins
    d.ingest(no_version_packet(id, 50));
    assert_eq!(d.sent().len(), 1);
    d.advance(Duration::from_secs(5));
    assert_eq!(d.dispatcher.num_time_wait_entries(), 0);

    d.drain_sent();
    d.ingest(setup_packet(id, VERSION, 1));
    assert_eq!(d.dispatcher.num_sessions(), 1);
}

#[test]
fn config_rejects_illegal_values() {
    let mut config = DispatchConfig::default();
    config.supported_versions(Vec::new());
    assert!(TestDispatch::try_new(config).is_err());

    let mut config = DispatchConfig::default();
    config.max_sessions(0);
    assert!(TestDispatch::try_new(config).is_err());
}
