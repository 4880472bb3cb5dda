#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use quanta::Instant;
use std::time::Duration;
use tandem_transport::fragment::{Reassembler, ReassemblyLimits};

/// Push arbitrary fragment payloads into one reassembler.
///
/// Input is split on 0xFF separators into individual fragments, all from
/// the same two peers. The reassembler must never panic and must not keep
/// buffered state for groups it has already completed or rejected.
fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let mut reassembler = Reassembler::new(Duration::from_secs(5), ReassemblyLimits::default());
    for (i, piece) in data.split(|&b| b == 0xFF).enumerate() {
        let peer = (i % 2) as u32 + 1;
        let _ = reassembler.push(peer, Bytes::copy_from_slice(piece), now);
    }
    reassembler.remove_peer(1);
    reassembler.remove_peer(2);
    assert_eq!(reassembler.tracked_bytes(), 0);
    assert_eq!(reassembler.pending_groups(), 0);
});
