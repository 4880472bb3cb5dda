#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tandem_transport::control::{CONTROL_RANGE_START, ControlMessage};

/// Fuzz every control message decoder.
///
/// The first byte picks one of the reserved protocol ids, the rest is the
/// body. Decoding must never panic, and whatever decodes must re-encode to
/// a body that decodes to the same message.
fuzz_target!(|data: &[u8]| {
    let Some((&selector, body)) = data.split_first() else {
        return;
    };
    let protocol_id = CONTROL_RANGE_START | selector as u16;
    if let Ok(msg) = ControlMessage::decode(protocol_id, Bytes::copy_from_slice(body)) {
        let again = ControlMessage::decode(msg.protocol_id(), msg.body());
        assert_eq!(again.ok(), Some(msg));
    }
});
