#![no_main]

use libfuzzer_sys::fuzz_target;
use nlsh_guard::Sanitizer;
use nlsh_guard::security::{SHELL_METACHARACTERS, sanitize_output};

fuzz_target!(|data: &[u8]| {
    let sanitizer = Sanitizer::default();

    // Input direction: single line, bounded, every metacharacter escaped
    let input = sanitizer.sanitize_input_bytes(data);
    assert!(!input.contains('\n') && !input.contains('\r'));
    assert!(input.chars().count() <= sanitizer.max_input_length());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            assert!(i + 1 < chars.len(), "dangling backslash");
            i += 2;
            continue;
        }
        assert!(!SHELL_METACHARACTERS.contains(&chars[i]), "unescaped metacharacter");
        i += 1;
    }

    // Output direction: no substitution syntax survives, and a second pass
    // is a no-op
    let text = String::from_utf8_lossy(data);
    let output = sanitize_output(&text);
    assert!(!output.contains('\n'));
    assert!(!output.contains('`'));
    assert!(!output.contains("$("));
    assert_eq!(sanitize_output(&output), output, "sanitize_output is not idempotent");
});
