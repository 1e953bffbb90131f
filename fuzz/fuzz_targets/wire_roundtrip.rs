#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_wire::protocol::types::Message;

// any message we can build must survive encoding and decoding
fuzz_target!(|message: Message| {
    if let Ok(octets) = message.to_octets() {
        assert_eq!(Ok(message), Message::from_octets(&octets).map_err(|e| e.error));
    }
});
