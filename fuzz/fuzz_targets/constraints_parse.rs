#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Parsing arbitrary constraints text must never panic; valid
        // parses expose well-formed names and hashes.
        if let Ok(lines) = chiron_lockfile::parse_constraints(text) {
            for line in lines {
                assert!(!line.name.is_empty());
                assert!(!line.hashes.is_empty());
                for hash in &line.hashes {
                    assert!(hash.is_well_formed());
                }
            }
        }
    }
});
