#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
            // Canonicalization must be a fixed point.
            let once = chiron_canonical::canonical_json(&value);
            let reparsed: serde_json::Value =
                serde_json::from_str(&once).expect("canonical output must be valid JSON");
            let twice = chiron_canonical::canonical_json(&reparsed);
            assert_eq!(once, twice);
        }
    }
});
