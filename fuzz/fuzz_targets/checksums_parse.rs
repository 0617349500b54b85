#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(entries) = chiron_canonical::parse_checksums(text) {
            // Accepted documents re-render into a parseable form with
            // the same entries.
            let rendered = chiron_canonical::render_checksums(&entries);
            let reparsed = chiron_canonical::parse_checksums(&rendered).expect("reparse");
            assert_eq!(reparsed, entries);
        }
    }
});
