#![no_main]

use libfuzzer_sys::fuzz_target;
use rank_matcher_client::Message;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that decodes must survive a re-encode unchanged.
    if let Ok(message) = Message::decode(frame) {
        let reencoded = message.encode();
        assert_eq!(Message::decode(&reencoded).ok(), Some(message));
    }
});
