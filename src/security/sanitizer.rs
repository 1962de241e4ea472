//! Input and output sanitization
//!
//! Trust flows differently in each direction. User text going to the backend
//! is escaped so it can never be read as shell syntax. Backend text coming
//! back is stripped down to a single line with every substitution span
//! removed.
//!
//! Neither direction ever fails: malformed input yields a best-effort safe
//! string, possibly empty.

use tracing::warn;

/// Shell metacharacters escaped in user input.
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '"', '\'',
];

/// Default limit on sanitized input, in code points.
pub const DEFAULT_MAX_INPUT_LENGTH: usize = 500;

const FENCE: &str = "```";

fn is_line_terminator(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\u{0B}' | '\u{0C}' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Invisible formatting characters that can disguise what a command does.
fn is_invisible_format(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{FEFF}'
    )
}

fn needs_escape(c: char) -> bool {
    c == '\\' || SHELL_METACHARACTERS.contains(&c)
}

/// Stateless text sanitizer.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_input_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_LENGTH)
    }
}

impl Sanitizer {
    #[must_use]
    pub const fn new(max_input_length: usize) -> Self {
        Self { max_input_length }
    }

    #[must_use]
    pub const fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// Sanitize a user request before it is embedded in a prompt.
    ///
    /// The result is single-line, at most `max_input_length` code points,
    /// and every shell metacharacter (and every backslash) is preceded by a
    /// backslash. Truncation never separates a backslash from the character
    /// it escapes.
    #[must_use]
    pub fn sanitize_input(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len().min(self.max_input_length * 2));
        let mut length = 0;

        for c in text.trim().chars() {
            let c = if is_line_terminator(c) { ' ' } else { c };
            if (c.is_control() && c != '\t') || c == char::REPLACEMENT_CHARACTER {
                continue;
            }

            let width = if needs_escape(c) { 2 } else { 1 };
            if length + width > self.max_input_length {
                break;
            }
            if width == 2 {
                out.push('\\');
            }
            out.push(c);
            length += width;
        }

        out.trim().to_string()
    }

    /// Like [`sanitize_input`](Self::sanitize_input) for raw bytes; invalid
    /// UTF-8 sequences are dropped.
    #[must_use]
    pub fn sanitize_input_bytes(&self, bytes: &[u8]) -> String {
        self.sanitize_input(&String::from_utf8_lossy(bytes))
    }

    /// See [`sanitize_output`].
    #[must_use]
    pub fn sanitize_output(&self, raw: &str) -> String {
        sanitize_output(raw)
    }
}

/// Reduce backend text to a single candidate command line.
///
/// Steps, in order: code fences, line terminators and tabs (to spaces), ANSI
/// escapes, non-printable characters, substitution spans (backticks, `$(...)`,
/// `${...}`, repeated until none remain), whitespace runs, trailing `;`, `|`
/// and `&`. The function is idempotent.
#[must_use]
pub fn sanitize_output(raw: &str) -> String {
    let text: String = strip_code_fences(raw)
        .chars()
        .map(|c| if is_line_terminator(c) || c == '\t' { ' ' } else { c })
        .collect();
    let mut text: String = strip_ansi_escapes::strip_str(&text)
        .chars()
        .filter(|&c| {
            !(c.is_control() || is_invisible_format(c) || c == char::REPLACEMENT_CHARACTER)
        })
        .collect();

    loop {
        let next = remove_substitutions(&text);
        if next == text {
            break;
        }
        text = next;
    }

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed =
        collapsed.trim_end_matches(|c: char| matches!(c, ';' | '|' | '&') || c.is_whitespace());

    let mut lines = trimmed.lines();
    let first = lines.next().unwrap_or_default();
    if lines.next().is_some() {
        warn!("Sanitized output still had several lines, keeping the first");
    }
    first.to_string()
}

/// Drop fence lines (```` ``` ```` with an optional language tag) and any
/// inline fence markers. A response that is nothing but one inline code
/// span is unwrapped.
fn strip_code_fences(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with(FENCE))
        .collect();
    let joined = kept.join("\n").replace(FENCE, "");

    let trimmed = joined.trim();
    if trimmed.len() >= 2
        && trimmed.starts_with('`')
        && trimmed.ends_with('`')
        && trimmed[1..trimmed.len() - 1].chars().all(|c| c != '`')
    {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    joined
}

/// One pass of substitution removal.
///
/// Backtick spans are removed with their contents, a lone backtick on its
/// own. `$(` and `${` spans are removed through the matching close bracket,
/// or to the end of the text when unterminated.
fn remove_substitutions(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '`' => {
                i = match chars[i + 1..].iter().position(|&c| c == '`') {
                    Some(offset) => i + offset + 2,
                    None => i + 1,
                };
            }
            '$' if matches!(chars.get(i + 1), Some('(' | '{')) => {
                let (open, close) = if chars[i + 1] == '(' {
                    ('(', ')')
                } else {
                    ('{', '}')
                };
                let mut depth = 0usize;
                let mut j = i + 1;
                while j < chars.len() {
                    if chars[j] == open {
                        depth += 1;
                    } else if chars[j] == close {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    j += 1;
                }
                i = j + 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============== Input ==============

    #[test]
    fn test_input_plain_text_unchanged() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input("list all files"), "list all files");
    }

    #[test]
    fn test_input_trims_whitespace() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input("  \t show disk usage \n "), "show disk usage");
    }

    #[test]
    fn test_input_trims_whitespace_behind_dropped_controls() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input("\0  list files"), "list files");
        assert_eq!(s.sanitize_input("\u{1b} \u{7} df -h \0"), "df -h");
    }

    #[test]
    fn test_input_escapes_metacharacters() {
        let s = Sanitizer::default();
        assert_eq!(
            s.sanitize_input("files; rm -rf / && echo $HOME"),
            r"files\; rm -rf / \&\& echo \$HOME"
        );
        assert_eq!(s.sanitize_input("a`b`c"), r"a\`b\`c");
        assert_eq!(s.sanitize_input("(x)[y]{z}<>\"'"), r#"\(x\)\[y\]\{z\}\<\>\"\'"#);
    }

    #[test]
    fn test_input_escapes_backslash() {
        let s = Sanitizer::default();
        // An existing backslash must not neutralize the escape of `;`
        assert_eq!(s.sanitize_input(r"a\;b"), r"a\\\;b");
    }

    #[test]
    fn test_input_line_terminators_become_spaces() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input("line one\nline two\r\nthree"), "line one line two  three");
        assert_eq!(s.sanitize_input("a\u{2028}b"), "a b");
    }

    #[test]
    fn test_input_strips_control_keeps_tab() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input("a\0b\x07c\td"), "abc\td");
    }

    #[test]
    fn test_input_truncates_to_limit() {
        let s = Sanitizer::new(10);
        let out = s.sanitize_input(&"x".repeat(50));
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn test_input_truncation_never_splits_escape() {
        let s = Sanitizer::new(4);
        // "abc" takes 3, the escaped ';' needs 2 more
        assert_eq!(s.sanitize_input("abc;"), "abc");
        assert_eq!(s.sanitize_input("ab;"), r"ab\;");
    }

    #[test]
    fn test_input_counts_code_points() {
        let s = Sanitizer::new(3);
        assert_eq!(s.sanitize_input("日本語テキスト"), "日本語");
    }

    #[test]
    fn test_input_invalid_bytes_dropped() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize_input_bytes(b"ls \xff\xfe-la"), "ls -la");
    }

    #[test]
    fn test_input_is_deterministic() {
        let s = Sanitizer::default();
        let text = "find big files | sort";
        assert_eq!(s.sanitize_input(text), s.sanitize_input(text));
    }

    // ============== Output ==============

    #[test]
    fn test_output_plain_command_unchanged() {
        assert_eq!(sanitize_output("ls -la"), "ls -la");
    }

    #[test]
    fn test_output_strips_code_fences() {
        assert_eq!(sanitize_output("```bash\nls -la\n```"), "ls -la");
        assert_eq!(sanitize_output("```\ndf -h\n```\n"), "df -h");
    }

    #[test]
    fn test_output_unwraps_single_inline_code_span() {
        assert_eq!(sanitize_output("`du -sh .`"), "du -sh .");
    }

    #[test]
    fn test_output_collapses_multiline_payload() {
        let out = sanitize_output("ls -la\nrm -rf ~");
        assert!(!out.contains('\n'));
        assert_eq!(out, "ls -la rm -rf ~");
    }

    #[test]
    fn test_output_strips_ansi() {
        assert_eq!(sanitize_output("\x1b[32mls\x1b[0m -la"), "ls -la");
    }

    #[test]
    fn test_output_removes_substitutions() {
        assert_eq!(sanitize_output("echo `id` done"), "echo done");
        assert_eq!(sanitize_output("echo $(whoami) done"), "echo done");
        assert_eq!(sanitize_output("echo ${HOME} done"), "echo done");
        assert_eq!(sanitize_output("echo $(echo $(id)) done"), "echo done");
    }

    #[test]
    fn test_output_unterminated_substitution_removed_to_end() {
        assert_eq!(sanitize_output("ls $(rm -rf ~"), "ls");
        assert_eq!(sanitize_output("ls ` rm x"), "ls rm x");
    }

    #[test]
    fn test_output_nested_spans_need_several_passes() {
        // Removing the backtick span exposes a new `$(`
        assert_eq!(sanitize_output("a $`x`(id) b"), "a b");
    }

    #[test]
    fn test_output_strips_trailing_chain_operators() {
        assert_eq!(sanitize_output("ls -la;"), "ls -la");
        assert_eq!(sanitize_output("ls -la |"), "ls -la");
        assert_eq!(sanitize_output("sleep 5 & ;  | "), "sleep 5");
    }

    #[test]
    fn test_output_collapses_whitespace_and_tabs() {
        assert_eq!(sanitize_output("  ls\t\t-la    /tmp  "), "ls -la /tmp");
    }

    #[test]
    fn test_output_removes_invisible_characters() {
        assert_eq!(sanitize_output("l\u{200B}s -la\u{202E}"), "ls -la");
    }

    #[test]
    fn test_output_empty_and_garbage() {
        assert_eq!(sanitize_output(""), "");
        assert_eq!(sanitize_output("```\n```"), "");
        assert_eq!(sanitize_output("\0\x01\x02"), "");
    }

    #[test]
    fn test_output_idempotent_on_adversarial_samples() {
        for raw in [
            "```sh\nls\n```\nrm -rf ~",
            "echo $(id) `x` ${y};",
            "a $`x`(id) b",
            "\x1b[31mred\x1b[0m | sh &",
            "`ls`",
            "`a` `b`",
            "x $(",
            "tab\there\u{2029}next",
        ] {
            let once = sanitize_output(raw);
            assert_eq!(sanitize_output(&once), once, "not idempotent for {raw:?}");
        }
    }
}
