//! Informational risk classification
//!
//! Classification never affects acceptance; it only decides which warning
//! the user sees next to an accepted command.

use std::fmt;

use serde::Serialize;

use super::rules::{HIGH_RISK_VERBS, MEDIUM_RISK_VERBS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Human-facing warning, `None` for low-risk commands.
    #[must_use]
    pub const fn warning(self) -> Option<&'static str> {
        match self {
            Self::Low => None,
            Self::Medium => Some(
                "This command modifies files or installed software. Review it before running.",
            ),
            Self::High => Some(
                "This command can destroy data or stop processes. \
                 Double-check every argument before running.",
            ),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        })
    }
}

/// Words that only prefix the real command.
fn is_prefix_word(word: &str) -> bool {
    matches!(
        word,
        "sudo" | "doas" | "nice" | "nohup" | "time" | "command" | "env" | "xargs"
    )
        || word.starts_with('-')
        || (word.contains('=') && !word.starts_with('='))
}

fn segment_risk(segment: &str) -> RiskLevel {
    let words: Vec<&str> = segment.split_whitespace().collect();
    let Some(position) = words.iter().position(|w| !is_prefix_word(w)) else {
        return RiskLevel::Low;
    };
    let verb = words[position].rsplit('/').next().unwrap_or(words[position]);
    let args = &words[position + 1..];

    if HIGH_RISK_VERBS.contains(&verb) || verb.starts_with("mkfs") {
        return RiskLevel::High;
    }
    if verb == "find" && args.iter().any(|a| matches!(*a, "-delete" | "-exec" | "-execdir")) {
        return RiskLevel::High;
    }
    if MEDIUM_RISK_VERBS.contains(&verb) {
        return RiskLevel::Medium;
    }
    if verb == "sed" && args.iter().any(|a| a.starts_with("-i") || *a == "--in-place") {
        return RiskLevel::Medium;
    }
    if segment.contains('>')
        && !segment.contains(">/dev/null")
        && !segment.contains("> /dev/null")
    {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Classify a command; the riskiest pipeline or chain segment wins.
#[must_use]
pub fn risk_level(command: &str) -> RiskLevel {
    command
        .split(['|', ';', '&'])
        .map(segment_risk)
        .max()
        .unwrap_or(RiskLevel::Low)
}
