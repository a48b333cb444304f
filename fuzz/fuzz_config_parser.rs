//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = gnlink_config::AppConfig::parse(s) {
            // Whatever parses and validates must render and parse back.
            if let Ok(rendered) = config.to_toml() {
                assert_eq!(gnlink_config::AppConfig::parse(&rendered).ok(), Some(config));
            }
        }
    }
});
