#![no_main]

use std::sync::LazyLock;

use libfuzzer_sys::fuzz_target;
use nlsh_guard::CommandValidator;

// Create validator ONCE at startup, reuse for all fuzz inputs
static VALIDATOR: LazyLock<Option<CommandValidator>> =
    LazyLock::new(|| CommandValidator::with_defaults().ok());

fuzz_target!(|data: &str| {
    let Some(validator) = VALIDATOR.as_ref() else {
        return;
    };

    let normal = validator.check(data, false);
    let restricted = validator.check(data, true);

    // 1. Empty commands must always be rejected
    if data.trim().is_empty() {
        assert!(normal.is_err(), "Empty command should be rejected");
    }

    // 2. Restricted mode only ever adds rejections
    if restricted.is_ok() {
        assert!(normal.is_ok(), "Restricted mode accepted what normal mode rejected");
    }

    // 3. Unquoted chaining never passes
    if normal.is_ok() {
        assert!(!data.trim().starts_with(';'));
    }
});
