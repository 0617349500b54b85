#![no_main]

use libfuzzer_sys::fuzz_target;

use chiron_tuf::{Envelope, RootPayload, TargetsPayload, TimestampPayload};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Role metadata deserialization must never panic on hostile
        // input; accepted envelopes must roundtrip.
        if let Ok(root) = serde_json::from_str::<Envelope<RootPayload>>(text) {
            let rendered = serde_json::to_string(&root).expect("serialize");
            let reparsed: Envelope<RootPayload> =
                serde_json::from_str(&rendered).expect("reparse");
            assert_eq!(reparsed, root);
        }
        let _ = serde_json::from_str::<Envelope<TargetsPayload>>(text);
        let _ = serde_json::from_str::<Envelope<TimestampPayload>>(text);
    }
});
