#![no_main]

use libfuzzer_sys::fuzz_target;
use nlsh_guard::ExportedEntry;

fuzz_target!(|data: &str| {
    // Parsing must never panic; anything accepted must survive a re-render
    if let Ok(entry) = ExportedEntry::parse(data) {
        let reparsed = ExportedEntry::parse(&entry.render()).expect("rendered entry must parse");
        assert_eq!(reparsed.key, entry.key);
        assert_eq!(reparsed.payload, entry.payload);
        assert_eq!(reparsed.ttl, entry.ttl);
    }
});
