#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Schema validation must never panic, and an accepted policy
        // must survive a serialize/parse roundtrip.
        if let Ok(policy) = chiron_policy::parse_policy(text) {
            let rendered = serde_json::to_string(&policy).expect("serialize");
            let reparsed = chiron_policy::parse_policy(&rendered).expect("reparse");
            assert_eq!(reparsed, policy);
        }
    }
});
