//! Reconstruction laws: arbitrary chunking and reordering of a byte
//! stream must rebuild the exact same records, and a single lost event
//! must cost exactly one gap without poisoning what follows.

mod common;

use std::time::Duration;

use common::Harness;
use proptest::prelude::*;
use socktrace_common::TrafficDirection::{self, Egress, Ingress};

const REQ: &[u8] = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
const RESP: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

const SEC: Duration = Duration::from_secs(1);

/// Sorted, deduplicated cut points strictly inside `len`.
fn cuts(len: usize) -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(1..len, 0..5).prop_map(|mut v| {
        v.sort_unstable();
        v.dedup();
        v
    })
}

fn chunk(bytes: &'static [u8], cut_points: &[usize]) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    for &cut in cut_points.iter().chain(std::iter::once(&bytes.len())) {
        if cut > start {
            out.push((start as u64, bytes[start..cut].to_vec()));
            start = cut;
        }
    }
    out
}

fn exchange() -> impl Strategy<Value = Vec<(TrafficDirection, u64, Vec<u8>)>> {
    (cuts(REQ.len()), cuts(RESP.len())).prop_flat_map(|(req_cuts, resp_cuts)| {
        let mut events: Vec<(TrafficDirection, u64, Vec<u8>)> = Vec::new();
        for (seq, bytes) in chunk(REQ, &req_cuts) {
            events.push((Egress, seq, bytes));
        }
        for (seq, bytes) in chunk(RESP, &resp_cuts) {
            events.push((Ingress, seq, bytes));
        }
        Just(events).prop_shuffle()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunked_reordered_delivery_reconstructs_the_exact_record(events in exchange()) {
        let mut h = Harness::new(Harness::test_config());
        h.open(7, 5, 1, 1_000, "1.2.3.4:80");
        for (direction, seq, bytes) in &events {
            let ts = match direction {
                Egress => 2_000,
                Ingress => 3_000,
            };
            h.data(7, 5, 1, *direction, *seq, ts, bytes);
        }
        h.tick(SEC);

        prop_assert_eq!(h.http_rows(), 1);
        let row = h.http_row(0);
        prop_assert_eq!(row.http_req_method.as_str(), "GET");
        prop_assert_eq!(row.http_req_path.as_str(), "/hello");
        prop_assert_eq!(row.http_resp_status, 200);
        prop_assert_eq!(row.http_resp_body.as_str(), "hello");
        prop_assert_eq!(row.http_resp_latency_ns, 1_000);
        prop_assert_eq!(h.metrics.reassembly_gaps.get(), 0);
    }

    #[test]
    fn arbitrary_bytes_never_panic_the_engine(
        egress in proptest::collection::vec(any::<u8>(), 0..512),
        ingress in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut h = Harness::new(Harness::test_config());
        h.open(7, 5, 1, 1_000, "1.2.3.4:80");
        h.data(7, 5, 1, Egress, 0, 2_000, &egress);
        h.data(7, 5, 1, Ingress, 0, 3_000, &ingress);
        h.tick(SEC);
        h.tick(2 * SEC);
    }
}

#[test]
fn dropping_one_event_costs_one_gap_and_the_next_message_still_parses() {
    let mut h = Harness::new(Harness::test_config());
    h.open(7, 5, 1, 1_000, "1.2.3.4:80");

    // Two pipelined requests.
    h.data(7, 5, 1, Egress, 0, 2_000, REQ);
    h.data(7, 5, 1, Egress, REQ.len() as u64, 2_100, REQ);

    // First response split in three; the middle event is lost. A second
    // complete response follows.
    let a = 10;
    let b = RESP.len() - 5;
    h.data(7, 5, 1, Ingress, 0, 3_000, &RESP[..a]);
    // RESP[a..b] never arrives.
    h.data(7, 5, 1, Ingress, b as u64, 3_200, &RESP[b..]);
    h.data(7, 5, 1, Ingress, RESP.len() as u64, 3_300, RESP);

    h.tick(SEC); // stall observed on the blocked head
    h.tick(Duration::from_millis(2_500)); // head abandoned, stream resyncs

    assert_eq!(h.metrics.reassembly_gaps.get(), 1);
    assert_eq!(h.http_rows(), 1);
    let row = h.http_row(0);
    // FIFO pairing: the surviving response drains the oldest request.
    assert_eq!(row.time_ns, 2_000);
    assert_eq!(row.http_resp_status, 200);
    assert_eq!(row.http_resp_body, "hello");
}
