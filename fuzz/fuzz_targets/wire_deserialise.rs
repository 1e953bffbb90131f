#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_wire::protocol::types::Message;

// any octets at all must either parse or fail cleanly: no panics, no
// out-of-bounds reads, no hangs on pointer games
fuzz_target!(|data: &[u8]| {
    let _ = Message::from_octets(data);
});
