//! Multi-stage command validation
//!
//! Stages run in order and the first failure wins:
//! 1. length bounds
//! 2. forbidden literals
//! 3. dangerous patterns
//! 4. structure (chaining, background jobs, subshells, process substitution,
//!    here-documents)
//! 5. suspicious constructs (system redirects, environment changes,
//!    alias/function definitions)
//! 6. quote and parenthesis balance
//! 7. restricted-mode policy, when requested
//!
//! Validation is a pure function of the command and the mode; the validator
//! holds only compiled rules.

use std::collections::HashSet;
use std::fmt;

use aho_corasick::AhoCorasick;
use regex::Regex;
use tracing::{debug, info};

use super::rules::{
    DANGEROUS_PATTERNS, FIND_MUTATING_ACTIONS, FORBIDDEN_LITERALS, LOADER_ENV_VARS,
    RESTRICTED_COMMANDS, SAFE_CHAIN_PATTERNS, SAFE_DEVICE_SINKS, SAFE_ENV_VARS, SYSTEM_DIRS,
};
use crate::config::SecurityConfig;
use crate::error::{GuardError, Result};

/// Why a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    TooLong { length: usize, max: usize },
    ForbiddenLiteral(String),
    DangerousPattern(String),
    CommandChaining(String),
    BackgroundExecution,
    Subshell,
    ProcessSubstitution,
    HereDocument,
    SystemRedirect(String),
    EnvironmentChange(String),
    LoaderEnvironment(String),
    Definition,
    Unbalanced(char),
    NotAllowedInRestrictedMode(String),
    PipeOrRedirectInRestrictedMode,
    MutatingFindAction(String),
}

impl RejectReason {
    /// Stable machine-readable reason code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong { .. } => "too_long",
            Self::ForbiddenLiteral(_) => "forbidden_literal",
            Self::DangerousPattern(_) => "dangerous_pattern",
            Self::CommandChaining(_) => "command_chaining",
            Self::BackgroundExecution => "background_execution",
            Self::Subshell => "subshell",
            Self::ProcessSubstitution => "process_substitution",
            Self::HereDocument => "here_document",
            Self::SystemRedirect(_) => "system_redirect",
            Self::EnvironmentChange(_) => "environment_change",
            Self::LoaderEnvironment(_) => "loader_environment",
            Self::Definition => "definition",
            Self::Unbalanced(_) => "unbalanced_delimiters",
            Self::NotAllowedInRestrictedMode(_) => "restricted_command",
            Self::PipeOrRedirectInRestrictedMode => "restricted_pipe_or_redirect",
            Self::MutatingFindAction(_) => "restricted_find_action",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "command is empty"),
            Self::TooLong { length, max } => {
                write!(f, "command is {length} characters, limit is {max}")
            }
            Self::ForbiddenLiteral(literal) => write!(f, "contains forbidden text '{literal}'"),
            Self::DangerousPattern(name) => write!(f, "matches dangerous pattern '{name}'"),
            Self::CommandChaining(op) => write!(f, "command chaining with '{op}' is not allowed"),
            Self::BackgroundExecution => write!(f, "background execution is not allowed"),
            Self::Subshell => write!(f, "command substitution is not allowed"),
            Self::ProcessSubstitution => write!(f, "process substitution is not allowed"),
            Self::HereDocument => write!(f, "here-documents are not allowed"),
            Self::SystemRedirect(path) => write!(f, "writes into system path {path}"),
            Self::EnvironmentChange(var) => {
                write!(f, "changing environment variable {var} is not allowed")
            }
            Self::LoaderEnvironment(var) => write!(f, "setting {var} is not allowed"),
            Self::Definition => write!(f, "alias and function definitions are not allowed"),
            Self::Unbalanced(c) => write!(f, "unbalanced '{c}'"),
            Self::NotAllowedInRestrictedMode(cmd) => {
                write!(f, "'{cmd}' is not allowed in restricted mode")
            }
            Self::PipeOrRedirectInRestrictedMode => {
                write!(f, "pipes and redirections are not allowed in restricted mode")
            }
            Self::MutatingFindAction(action) => {
                write!(f, "find {action} is not allowed in restricted mode")
            }
        }
    }
}

/// Shell operators seen outside quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Semicolon,
    And,
    Or,
    Pipe,
    Background,
    Backtick,
    CommandSubstitution,
    ProcessSubstitution,
    HereDocument,
    Redirect,
}

/// Lexical scan for shell operators.
///
/// Single quotes disable everything; double quotes disable all operators
/// except backticks and `$(`; a backslash outside single quotes escapes the
/// next character. An unquoted line break separates commands like `;`.
fn scan_operators(command: &str) -> Vec<Operator> {
    let chars: Vec<char> = command.chars().collect();
    let mut ops = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                i += 2;
                continue;
            }
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            '`' => ops.push(Operator::Backtick),
            '$' if next == Some('(') => ops.push(Operator::CommandSubstitution),
            _ if in_double => {}
            ';' | '\n' | '\r' => ops.push(Operator::Semicolon),
            '&' => match next {
                Some('&') => {
                    ops.push(Operator::And);
                    i += 1;
                }
                Some('>') => {
                    ops.push(Operator::Redirect);
                    i += 1;
                }
                // `2>&1`, `>&2`
                _ if i > 0 && chars[i - 1] == '>' => {}
                _ => ops.push(Operator::Background),
            },
            '|' => {
                if next == Some('|') {
                    ops.push(Operator::Or);
                    i += 1;
                } else {
                    ops.push(Operator::Pipe);
                }
            }
            '<' => match next {
                Some('(') => ops.push(Operator::ProcessSubstitution),
                Some('<') => {
                    ops.push(Operator::HereDocument);
                    i += 1;
                }
                _ => {}
            },
            '>' => match next {
                Some('(') => ops.push(Operator::ProcessSubstitution),
                // `>>` and the clobbering `>|`
                Some('>' | '|') => {
                    ops.push(Operator::Redirect);
                    i += 1;
                }
                _ => ops.push(Operator::Redirect),
            },
            _ => {}
        }
        i += 1;
    }

    ops
}

/// Lowercase and collapse whitespace, with a trailing space so literals
/// ending in a space also match at the end of the command.
fn normalize_for_literals(command: &str) -> String {
    let mut normalized = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    normalized.push(' ');
    normalized
}

/// Lexically resolve `.` and `..` in an absolute path.
fn normalize_abs_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn is_system_path(path: &str) -> bool {
    let path = normalize_abs_path(path);
    if SAFE_DEVICE_SINKS.contains(&path.as_str()) {
        return false;
    }
    SYSTEM_DIRS
        .iter()
        .any(|dir| path == *dir || path.starts_with(&format!("{dir}/")))
}

fn basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn compile(pattern: &str, field: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| GuardError::ConfigInvalid {
        field: field.to_string(),
        reason: format!("invalid regex '{pattern}': {e}"),
    })
}

/// Compiled validation rules.
pub struct CommandValidator {
    max_length: usize,
    literals: Vec<String>,
    literal_matcher: AhoCorasick,
    dangerous: Vec<(String, Regex)>,
    safe_chains: Vec<Regex>,
    safe_env_vars: HashSet<String>,
    redirect_target: Regex,
    env_command: Regex,
    loader_env: Regex,
    definitions: [Regex; 2],
}

impl CommandValidator {
    /// Build a validator from the built-in rule tables plus the
    /// configuration's extensions.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if an extra pattern is not a valid regex.
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let literals: Vec<String> = FORBIDDEN_LITERALS
            .iter()
            .map(|s| (*s).to_string())
            .chain(
                config
                    .extra_forbidden
                    .iter()
                    .map(|s| normalize_for_literals(s).trim_end().to_string())
                    .filter(|s| !s.is_empty()),
            )
            .collect();
        let literal_matcher = AhoCorasick::new(&literals).map_err(|e| GuardError::ConfigInvalid {
            field: "security.extra_forbidden".to_string(),
            reason: e.to_string(),
        })?;

        let mut dangerous = Vec::with_capacity(DANGEROUS_PATTERNS.len());
        for def in DANGEROUS_PATTERNS {
            dangerous.push((def.name.to_string(), compile(def.pattern, "rules")?));
        }
        for (i, pattern) in config.extra_dangerous_patterns.iter().enumerate() {
            dangerous.push((
                format!("custom_{i}"),
                compile(pattern, "security.extra_dangerous_patterns")?,
            ));
        }

        let safe_chains = SAFE_CHAIN_PATTERNS
            .iter()
            .map(|def| compile(def.pattern, "rules"))
            .collect::<Result<Vec<_>>>()?;

        let safe_env_vars = SAFE_ENV_VARS
            .iter()
            .map(|s| (*s).to_string())
            .chain(config.extra_safe_env_vars.iter().cloned())
            .collect();

        let loader_env = compile(
            &format!(r"(?:^|[\s;&|(])(?:{})=", LOADER_ENV_VARS.join("|")),
            "rules",
        )?;

        info!(
            literals = literals.len(),
            patterns = dangerous.len(),
            "Command validator initialized"
        );

        Ok(Self {
            max_length: config.max_command_length,
            literals,
            literal_matcher,
            dangerous,
            safe_chains,
            safe_env_vars,
            redirect_target: compile(
                r#"(?:>\|?|\btee\b(?:\s+-\S+)*)\s*["']?(/[^\s;&|<>"']*)"#,
                "rules",
            )?,
            env_command: compile(
                r"(?:^|[;&|(]\s*)(?:sudo\s+)?(?:export|unset|(?:declare|typeset)\s+-\S*x\S*)\b((?:\s+[^\s;&|)]+)*)",
                "rules",
            )?,
            loader_env,
            definitions: [
                compile(r"(?:^|[;&|(]\s*)(?:alias|unalias|function)\b", "rules")?,
                compile(r"[A-Za-z_][\w.-]*\s*\(\s*\)\s*\{", "rules")?,
            ],
        })
    }

    /// Validator with the built-in rules only.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the built-in patterns are covered by tests.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&SecurityConfig::default())
    }

    /// Validate a candidate command.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CommandDenied`] carrying the first failing
    /// stage's reason.
    pub fn validate(&self, command: &str, restricted: bool) -> Result<()> {
        self.check(command, restricted).map_err(|reason| {
            debug!(code = reason.code(), reason = %reason, "Command rejected");
            GuardError::CommandDenied { reason }
        })
    }

    /// Like [`validate`](Self::validate) but returns the bare reason.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's reason.
    pub fn check(&self, command: &str, restricted: bool) -> std::result::Result<(), RejectReason> {
        let command = command.trim();
        self.check_length(command)?;
        self.check_literals(command)?;
        self.check_patterns(command)?;
        self.check_structure(command)?;
        self.check_suspicious(command)?;
        check_balance(command)?;
        if restricted {
            check_restricted(command)?;
        }
        Ok(())
    }

    fn check_length(&self, command: &str) -> std::result::Result<(), RejectReason> {
        if command.is_empty() {
            return Err(RejectReason::Empty);
        }
        let length = command.chars().count();
        if length > self.max_length {
            return Err(RejectReason::TooLong {
                length,
                max: self.max_length,
            });
        }
        Ok(())
    }

    fn check_literals(&self, command: &str) -> std::result::Result<(), RejectReason> {
        let normalized = normalize_for_literals(command);
        match self.literal_matcher.find(&normalized) {
            Some(m) => Err(RejectReason::ForbiddenLiteral(
                self.literals[m.pattern().as_usize()].trim_end().to_string(),
            )),
            None => Ok(()),
        }
    }

    fn check_patterns(&self, command: &str) -> std::result::Result<(), RejectReason> {
        match self.dangerous.iter().find(|(_, re)| re.is_match(command)) {
            Some((name, _)) => Err(RejectReason::DangerousPattern(name.clone())),
            None => Ok(()),
        }
    }

    fn check_structure(&self, command: &str) -> std::result::Result<(), RejectReason> {
        let ops = scan_operators(command);

        if ops
            .iter()
            .any(|op| matches!(op, Operator::Backtick | Operator::CommandSubstitution))
        {
            return Err(RejectReason::Subshell);
        }
        if ops.contains(&Operator::ProcessSubstitution) {
            return Err(RejectReason::ProcessSubstitution);
        }
        if ops.contains(&Operator::HereDocument) {
            return Err(RejectReason::HereDocument);
        }
        if ops.contains(&Operator::Background) {
            return Err(RejectReason::BackgroundExecution);
        }
        if ops.contains(&Operator::Semicolon) {
            return Err(RejectReason::CommandChaining(";".to_string()));
        }
        if ops.contains(&Operator::Or) {
            return Err(RejectReason::CommandChaining("||".to_string()));
        }
        if ops.contains(&Operator::And) && !self.safe_chains.iter().any(|re| re.is_match(command))
        {
            return Err(RejectReason::CommandChaining("&&".to_string()));
        }
        Ok(())
    }

    fn check_suspicious(&self, command: &str) -> std::result::Result<(), RejectReason> {
        for caps in self.redirect_target.captures_iter(command) {
            if let Some(path) = caps.get(1)
                && is_system_path(path.as_str())
            {
                return Err(RejectReason::SystemRedirect(path.as_str().to_string()));
            }
        }

        if let Some(m) = self.loader_env.find(command) {
            let var = m
                .as_str()
                .trim_start_matches(|c: char| c.is_whitespace() || ";&|(".contains(c))
                .trim_end_matches('=');
            return Err(RejectReason::LoaderEnvironment(var.to_string()));
        }

        for caps in self.env_command.captures_iter(command) {
            let args = caps.get(1).map_or("", |m| m.as_str());
            for arg in args.split_whitespace().filter(|a| !a.starts_with('-')) {
                let name = arg.split('=').next().unwrap_or(arg);
                if !self.safe_env_vars.contains(name) {
                    return Err(RejectReason::EnvironmentChange(name.to_string()));
                }
            }
        }

        if self.definitions.iter().any(|re| re.is_match(command)) {
            return Err(RejectReason::Definition);
        }

        Ok(())
    }
}

fn check_balance(command: &str) -> std::result::Result<(), RejectReason> {
    let count = |target: char| command.chars().filter(|&c| c == target).count();

    if count('\'') % 2 != 0 {
        return Err(RejectReason::Unbalanced('\''));
    }
    if count('"') % 2 != 0 {
        return Err(RejectReason::Unbalanced('"'));
    }
    let (open, close) = (count('('), count(')'));
    if open != close {
        return Err(RejectReason::Unbalanced(if open > close { '(' } else { ')' }));
    }
    Ok(())
}

fn check_restricted(command: &str) -> std::result::Result<(), RejectReason> {
    let first = command.split_whitespace().next().map_or("", basename);
    if !RESTRICTED_COMMANDS.contains(&first) {
        return Err(RejectReason::NotAllowedInRestrictedMode(first.to_string()));
    }
    if command.contains('|') || command.contains('>') {
        return Err(RejectReason::PipeOrRedirectInRestrictedMode);
    }
    if first == "find"
        && let Some(action) = command
            .split_whitespace()
            .find(|word| FIND_MUTATING_ACTIONS.contains(word))
    {
        return Err(RejectReason::MutatingFindAction(action.to_string()));
    }
    Ok(())
}
