#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(version) = text.parse::<chiron_version::Version>() {
            // Display must reparse to an equal version.
            let rendered = version.to_string();
            let reparsed: chiron_version::Version =
                rendered.parse().expect("rendered version must reparse");
            assert_eq!(reparsed, version);
        }

        // Specifier sets must never panic on arbitrary input.
        let _ = text.parse::<chiron_version::SpecifierSet>();
    }
});
