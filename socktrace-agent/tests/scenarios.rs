//! End-to-end engine behavior, driven through synthesized kernel events.

mod common;

use std::time::Duration;

use common::{h2_frame, h2_literal, mysql_packet, Harness};
use socktrace_agent::errors::DropReason;
use socktrace_agent::tracer::tracker::TrackerState;
use socktrace_common::TrafficDirection::{Egress, Ingress};

const REQ: &[u8] = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
const RESP: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

const SEC: Duration = Duration::from_secs(1);

#[test]
fn http_happy_path() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.data(7, 5, 1, Ingress, 0, 3_000, RESP);
    h.close(7, 5, 1, 4_000);
    h.tick(SEC);

    assert_eq!(h.http_rows(), 1);
    let row = h.http_row(0);
    assert_eq!(row.tgid, 7);
    assert_eq!(row.fd, 5);
    assert_eq!(row.remote_addr, "1.2.3.4");
    assert_eq!(row.remote_port, 80);
    assert_eq!(row.http_req_method, "GET");
    assert_eq!(row.http_req_path, "/hello");
    assert_eq!(row.http_req_headers, "host: x");
    assert_eq!(row.http_resp_status, 200);
    assert_eq!(row.http_resp_body, "hello");
    assert_eq!(row.http_resp_latency_ns, 1_000);
    assert_eq!(row.time_ns, 2_000);

    // Closed and drained: gone after the one-tick grace period.
    h.tick(2 * SEC);
    assert_eq!(h.tracer.tracker_count(), 0);
}

#[test]
fn out_of_order_delivery_reconstructs_the_same_row() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    // Response tail arrives before its head.
    let split = RESP.len() - 5;
    h.data(7, 5, 1, Ingress, split as u64, 3_500, &RESP[split..]);
    h.data(7, 5, 1, Ingress, 0, 3_000, &RESP[..split]);
    h.tick(SEC);

    assert_eq!(h.http_rows(), 1);
    let row = h.http_row(0);
    assert_eq!(row.http_resp_status, 200);
    assert_eq!(row.http_resp_body, "hello");
    assert_eq!(row.http_req_path, "/hello");
}

#[test]
fn gap_skips_after_timeout_and_request_expires_without_a_row() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    // Response header only, then a chunk far beyond a lost middle.
    h.data(7, 5, 1, Ingress, 0, 3_000, b"HTTP/1.1 200 OK\r\n");
    h.data(7, 5, 1, Ingress, 100, 3_100, b"world");

    h.tick(SEC); // stall observed
    h.tick(2 * SEC); // gap skipped
    assert_eq!(h.metrics.reassembly_gaps.get(), 1);
    assert_eq!(h.http_rows(), 0);

    // The unanswered request ages out without producing a row.
    h.tick(13 * SEC);
    assert_eq!(h.http_rows(), 0);
    assert_eq!(h.metrics.requests_expired.get(), 1);
}

#[test]
fn generation_reuse_freezes_the_old_tracker() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.close(7, 5, 1, 3_000);
    h.open(7, 5, 2, 10_000, "1.2.3.4:80");

    {
        let generations = h.tracer.generations(7, 5).expect("stream key exists");
        assert_eq!(
            generations.get(1).expect("old tracker").state(),
            TrackerState::ReadyForDestruction
        );
        assert_eq!(
            generations.get(2).expect("new tracker").state(),
            TrackerState::Collecting
        );
    }

    // Data for the superseded generation is refused.
    h.data(7, 5, 1, Ingress, 0, 11_000, RESP);
    let drops = h
        .metrics
        .ingest_drops
        .get_or_create(&DropReason::TooOldGeneration.into())
        .get();
    assert_eq!(drops, 1);

    // The fresh generation works unaffected.
    h.data(7, 5, 2, Egress, 0, 12_000, REQ);
    h.data(7, 5, 2, Ingress, 0, 13_000, RESP);
    h.tick(SEC);
    assert_eq!(h.http_rows(), 1);
    assert_eq!(h.http_row(0).time_ns, 12_000);
}

#[test]
fn mysql_prepare_execute_substitutes_arguments() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "10.0.0.2:3306");

    // COM_STMT_PREPARE "SELECT ?"
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT ?");
    let prepare_pkt = mysql_packet(0, &prepare);
    h.data(7, 5, 1, Egress, 0, 2_000, &prepare_pkt);

    // Prepare response: stmt_id=42, 1 column, 1 param, then defs + EOFs.
    let mut prepare_ok = vec![0x00];
    prepare_ok.extend_from_slice(&42u32.to_le_bytes());
    prepare_ok.extend_from_slice(&1u16.to_le_bytes());
    prepare_ok.extend_from_slice(&1u16.to_le_bytes());
    prepare_ok.extend_from_slice(&[0, 0, 0]);
    let mut resp1 = mysql_packet(1, &prepare_ok);
    resp1.extend_from_slice(&mysql_packet(2, b"param-def"));
    resp1.extend_from_slice(&mysql_packet(3, &[0xfe, 0, 0, 2, 0]));
    resp1.extend_from_slice(&mysql_packet(4, b"col-def"));
    resp1.extend_from_slice(&mysql_packet(5, &[0xfe, 0, 0, 2, 0]));
    h.data(7, 5, 1, Ingress, 0, 3_000, &resp1);

    // COM_STMT_EXECUTE stmt_id=42, one LONGLONG argument = 7.
    let mut execute = vec![0x17];
    execute.extend_from_slice(&42u32.to_le_bytes());
    execute.push(0);
    execute.extend_from_slice(&1u32.to_le_bytes());
    execute.push(0); // null bitmap
    execute.push(1); // new params bound
    execute.extend_from_slice(&[0x08, 0x00]);
    execute.extend_from_slice(&7i64.to_le_bytes());
    let execute_pkt = mysql_packet(0, &execute);
    h.data(7, 5, 1, Egress, prepare_pkt.len() as u64, 4_000, &execute_pkt);

    // Execute response: one-row resultset.
    let mut resp2 = mysql_packet(1, &[0x01]);
    resp2.extend_from_slice(&mysql_packet(2, b"col-def"));
    resp2.extend_from_slice(&mysql_packet(3, &[0xfe, 0, 0, 2, 0]));
    resp2.extend_from_slice(&mysql_packet(4, &[0x01, b'7']));
    resp2.extend_from_slice(&mysql_packet(5, &[0xfe, 0, 0, 2, 0]));
    h.data(7, 5, 1, Ingress, resp1.len() as u64, 5_000, &resp2);

    h.tick(SEC);
    assert_eq!(h.mysql_rows(), 2);
    let prepare_row = h.mysql_row(0);
    assert_eq!(prepare_row.mysql_cmd, "COM_STMT_PREPARE");
    assert_eq!(prepare_row.mysql_body, "SELECT ?");
    assert_eq!(prepare_row.remote_port, 3306);
    let execute_row = h.mysql_row(1);
    assert_eq!(execute_row.mysql_cmd, "COM_STMT_EXECUTE");
    assert_eq!(execute_row.mysql_body, "SELECT 7");
    assert_eq!(execute_row.mysql_resp_body, "Resultset: 1 rows");
    assert_eq!(execute_row.mysql_resp_latency_ns, 1_000);
}

#[test]
fn self_tracing_guard_drops_own_records() {
    let mut cfg = Harness::test_config();
    cfg.self_tgid = 7;
    cfg.disable_self_tracing = true;
    let mut h = Harness::new(cfg);
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.data(7, 5, 1, Ingress, 0, 3_000, RESP);
    h.tick(SEC);

    assert_eq!(h.http_rows(), 0);
    assert_eq!(h.metrics.records_filtered.get(), 1);
}

#[test]
fn duplicate_events_do_not_duplicate_records() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    // Every event delivered twice, as overlapping probe pairs would.
    for _ in 0..2 {
        h.open(7, 5, 1, 1_000, "1.2.3.4:80");
        h.data(7, 5, 1, Egress, 0, 2_000, REQ);
        h.data(7, 5, 1, Ingress, 0, 3_000, RESP);
    }
    h.tick(SEC);
    assert_eq!(h.http_rows(), 1);

    // Replaying after the tick adds nothing either.
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.data(7, 5, 1, Ingress, 0, 3_000, RESP);
    h.tick(2 * SEC);
    assert_eq!(h.http_rows(), 1);
}

#[test]
fn conflicting_duplicate_disables_the_tracker() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    let mut tampered = REQ.to_vec();
    tampered[0] = b'P';
    h.data(7, 5, 1, Egress, 0, 2_000, &tampered);

    let generations = h.tracer.generations(7, 5).expect("stream key exists");
    assert_eq!(
        generations.get(1).expect("tracker").state(),
        TrackerState::Disabled
    );
}

#[test]
fn disabled_tracker_survives_close_and_refuses_late_data() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    let mut tampered = REQ.to_vec();
    tampered[0] = b'P';
    h.data(7, 5, 1, Egress, 0, 2_000, &tampered);
    // A close on the disabled connection must not promote it into the
    // destruction pipeline; its generation slot has to stay occupied.
    h.close(7, 5, 1, 3_000);
    h.tick(SEC);
    h.tick(2 * SEC);
    h.tick(3 * SEC);

    {
        let generations = h.tracer.generations(7, 5).expect("stream key exists");
        assert_eq!(
            generations.get(1).expect("tracker").state(),
            TrackerState::Disabled
        );
    }

    // A reordered straggler for the same generation is dropped, not
    // collected by a freshly fabricated tracker.
    h.data(7, 5, 1, Ingress, 0, 4_000, RESP);
    let drops = h
        .metrics
        .ingest_drops
        .get_or_create(&DropReason::TrackerDisabled.into())
        .get();
    assert_eq!(drops, 1);
    h.tick(4 * SEC);
    assert_eq!(h.http_rows(), 0);
    let generations = h.tracer.generations(7, 5).expect("stream key exists");
    assert_eq!(
        generations.get(1).expect("tracker").state(),
        TrackerState::Disabled
    );
}

#[test]
fn classify_window_is_evaluated_per_direction() {
    let mut cfg = Harness::test_config();
    cfg.classify_window = 64;
    let mut h = Harness::new(cfg);
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, &[0x55u8; 40]);
    h.data(7, 5, 1, Ingress, 0, 2_100, &[0x66u8; 40]);
    h.tick(SEC);

    // 80 unclassifiable bytes combined, but neither direction has shown a
    // full window yet.
    {
        let generations = h.tracer.generations(7, 5).expect("stream key exists");
        assert_eq!(
            generations.get(1).expect("tracker").state(),
            TrackerState::Collecting
        );
    }

    // Once one direction exhausts the window on its own, give up.
    h.data(7, 5, 1, Egress, 40, 2_200, &[0x55u8; 30]);
    h.tick(2 * SEC);
    let generations = h.tracer.generations(7, 5).expect("stream key exists");
    assert_eq!(
        generations.get(1).expect("tracker").state(),
        TrackerState::Disabled
    );
}

#[test]
fn truncated_payload_becomes_a_gap_not_a_fatal() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    // Response body truncated by the kernel: 2 of 5 body bytes shipped.
    let head_len = RESP.len() - 3;
    h.data_truncated(7, 5, 1, Ingress, 0, 3_000, &RESP[..head_len], RESP.len() as u64);
    // A second, complete exchange follows the hole.
    h.data(7, 5, 1, Egress, REQ.len() as u64, 4_000, REQ);
    h.data(7, 5, 1, Ingress, RESP.len() as u64, 5_000, RESP);

    h.tick(SEC);
    // The truncated response was skipped as a gap; the follow-up response
    // still parsed and matched FIFO against the oldest request.
    assert!(h.metrics.reassembly_gaps.get() >= 1);
    assert_eq!(h.http_rows(), 1);
    let generations = h.tracer.generations(7, 5).expect("stream key exists");
    assert_eq!(
        generations.get(1).expect("tracker").state(),
        TrackerState::Collecting
    );
}

#[test]
fn grpc_stream_lands_in_the_http_table() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "10.0.0.9:443");

    let mut egress = socktrace_agent::protocols::http2::PREFACE.to_vec();
    let mut req_block = h2_literal(":method", "POST");
    req_block.extend_from_slice(&h2_literal(":path", "/demo.Greeter/Greet"));
    req_block.extend_from_slice(&h2_literal("content-type", "application/grpc"));
    egress.extend_from_slice(&h2_frame(0x1, 0x4, 1, &req_block));
    let mut grpc_msg = vec![0u8];
    grpc_msg.extend_from_slice(&3u32.to_be_bytes());
    grpc_msg.extend_from_slice(b"abc");
    egress.extend_from_slice(&h2_frame(0x0, 0x1, 1, &grpc_msg));
    h.data(7, 5, 1, Egress, 0, 2_000, &egress);

    let mut resp_block = h2_literal(":status", "200");
    resp_block.extend_from_slice(&h2_literal("content-type", "application/grpc"));
    let mut ingress = h2_frame(0x1, 0x4, 1, &resp_block);
    ingress.extend_from_slice(&h2_frame(0x0, 0x0, 1, &grpc_msg));
    ingress.extend_from_slice(&h2_frame(0x1, 0x4 | 0x1, 1, &h2_literal("grpc-status", "0")));
    h.data(7, 5, 1, Ingress, 0, 3_000, &ingress);

    h.tick(SEC);
    assert_eq!(h.http_rows(), 1);
    let row = h.http_row(0);
    assert_eq!(row.http_major_version, 2);
    assert_eq!(row.http_req_method, "POST");
    assert_eq!(row.http_req_path, "/demo.Greeter/Greet");
    assert_eq!(row.http_resp_status, 200);
    assert_eq!(row.http_resp_message, "grpc-status 0");
    assert_eq!(row.http_req_body, "1 message(s), 3 bytes");
}

#[test]
fn response_header_filter_drops_non_matching_rows() {
    let mut cfg = Harness::test_config();
    cfg.http_response_header_filters = "Content-Type:json".to_string();
    let mut h = Harness::new(cfg);
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.data(
        7,
        5,
        1,
        Ingress,
        0,
        3_000,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nhi",
    );
    h.tick(SEC);
    assert_eq!(h.http_rows(), 0);
    assert_eq!(h.metrics.records_filtered.get(), 1);
}

#[test]
fn inactivity_tears_the_tracker_down() {
    let mut cfg = Harness::test_config();
    cfg.inactivity_ttl = Duration::from_secs(30);
    let mut h = Harness::new(cfg);
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    assert_eq!(h.tracer.tracker_count(), 1);

    h.tick(31 * SEC); // marks ready for destruction
    h.tick(32 * SEC); // grace period over, removed
    assert_eq!(h.tracer.tracker_count(), 0);
}

#[test]
fn unknown_protocol_disables_after_classify_window() {
    let mut cfg = Harness::test_config();
    cfg.classify_window = 64;
    let mut h = Harness::new(cfg);
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");
    h.data(7, 5, 1, Egress, 0, 2_000, &[0x55u8; 80]);
    h.tick(SEC);

    let generations = h.tracer.generations(7, 5).expect("stream key exists");
    assert_eq!(
        generations.get(1).expect("tracker").state(),
        TrackerState::Disabled
    );
}

#[test]
fn close_for_unknown_connection_counts_as_drop() {
    let mut h = Harness::new(Harness::test_config());
    h.close(99, 3, 1, 1_000);
    let drops = h
        .metrics
        .ingest_drops
        .get_or_create(&DropReason::UnknownPid.into())
        .get();
    assert_eq!(drops, 1);
    assert_eq!(h.tracer.tracker_count(), 0);
}
