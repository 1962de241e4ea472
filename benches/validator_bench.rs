//! Benchmarks for command validation and sanitization
//!
//! Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use nlsh_guard::config::SecurityConfig;
use nlsh_guard::security::{CommandValidator, Sanitizer, risk_level, sanitize_output};
use std::hint::black_box;

fn create_extended_config() -> SecurityConfig {
    SecurityConfig {
        extra_forbidden: vec!["terraform destroy".to_string(), "git push --force".to_string()],
        extra_dangerous_patterns: vec![
            r"\bdocker\s+system\s+prune\b".to_string(),
            r"\bkubectl\s+delete\s+(?:ns|namespace)\b".to_string(),
        ],
        ..SecurityConfig::default()
    }
}

fn benchmark_validation(c: &mut Criterion) {
    let validator = CommandValidator::with_defaults().unwrap();
    let extended = CommandValidator::new(&create_extended_config()).unwrap();

    // Simple command benchmarks
    c.bench_function("normal: simple command (ls -la)", |b| {
        b.iter(|| validator.check(black_box("ls -la"), false));
    });

    c.bench_function("restricted: simple command (ls -la)", |b| {
        b.iter(|| validator.check(black_box("ls -la"), true));
    });

    // Pipeline that passes every stage
    c.bench_function("normal: pipeline (find | xargs grep)", |b| {
        b.iter(|| {
            validator.check(
                black_box("find . -name '*.rs' -type f | xargs grep -n 'unsafe' 2>/dev/null"),
                false,
            )
        });
    });

    c.bench_function("extended rules: pipeline (find | xargs grep)", |b| {
        b.iter(|| {
            extended.check(
                black_box("find . -name '*.rs' -type f | xargs grep -n 'unsafe' 2>/dev/null"),
                false,
            )
        });
    });

    // Forbidden literal (should fail at the first stage)
    c.bench_function("normal: forbidden literal (rm -rf /)", |b| {
        b.iter(|| validator.check(black_box("rm -rf /"), false));
    });

    // Chaining is only caught by the structure stage
    c.bench_function("normal: chained command (ls; id)", |b| {
        b.iter(|| validator.check(black_box("ls; id"), false));
    });

    // Maximum length command
    let long_command = format!("echo {}", "a".repeat(995));
    c.bench_function("normal: 1000 character command", |b| {
        b.iter(|| validator.check(black_box(&long_command), false));
    });
}

fn benchmark_sanitization(c: &mut Criterion) {
    let sanitizer = Sanitizer::default();

    c.bench_function("sanitize input (plain request)", |b| {
        b.iter(|| sanitizer.sanitize_input(black_box("show the ten largest files in this directory")));
    });

    c.bench_function("sanitize input (metacharacter heavy)", |b| {
        b.iter(|| sanitizer.sanitize_input(black_box("a;b|c&d$(e)`f`{g}[h]<i>'j'\"k\"\\l")));
    });

    c.bench_function("sanitize output (fenced markdown)", |b| {
        b.iter(|| sanitize_output(black_box("```bash\ndu -sh * | sort -h | tail -n 10\n```\n")));
    });

    c.bench_function("sanitize output (nested substitutions)", |b| {
        b.iter(|| sanitize_output(black_box("echo $(echo $(echo `id`)) ${HOME} done;")));
    });

    c.bench_function("risk level (sudo rm)", |b| {
        b.iter(|| risk_level(black_box("sudo rm -i old.log")));
    });
}

fn benchmark_validator_creation(c: &mut Criterion) {
    let config = create_extended_config();

    c.bench_function("validator creation (built-in + 4 extra rules)", |b| {
        b.iter(|| CommandValidator::new(black_box(&config)));
    });
}

criterion_group!(
    benches,
    benchmark_validation,
    benchmark_sanitization,
    benchmark_validator_creation
);
criterion_main!(benches);
