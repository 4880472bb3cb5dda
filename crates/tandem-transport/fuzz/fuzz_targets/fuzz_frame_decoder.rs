#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tandem_transport::wire::{FrameDecoder, UnreliableFrame};

/// Feed arbitrary bytes through the stream decoder in uneven reads, and
/// through the datagram parser in one piece.
///
/// Every decoded frame must respect the size limit and survive a re-encode.
fuzz_target!(|data: &[u8]| {
    const LIMIT: usize = 4096;
    let mut dec = FrameDecoder::new(LIMIT);
    for chunk in data.chunks(7) {
        dec.extend(chunk);
        loop {
            match dec.next_frame() {
                Ok(Some(frame)) => {
                    assert!(frame.encoded_len() <= LIMIT);
                    let mut again = FrameDecoder::new(LIMIT);
                    again.extend(&frame.to_bytes());
                    assert_eq!(again.next_frame().ok().flatten(), Some(frame));
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }

    if let Ok(frame) = UnreliableFrame::decode(Bytes::copy_from_slice(data)) {
        assert_eq!(frame.encoded_len(), data.len());
    }
});
