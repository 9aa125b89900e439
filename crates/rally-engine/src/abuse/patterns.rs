//! Spam signature matching

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identical characters in a row that count as spam
const REPEATED_CHAR_RUN: usize = 5;

/// Length of a two-character alternation (`abababab`) that counts as spam
const ALTERNATING_RUN: usize = 8;

/// Which spam signature a message matched
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpamSignature {
    /// Same character repeated 5+ times
    RepeatedChar,
    /// Two characters alternating for 8+ characters
    AlternatingRun,
    /// Only punctuation/symbols, 5+ characters
    AllSpecial,
    /// Only digits, 10+ characters
    AllDigits,
    /// A single unbroken run of 20+ letters
    AllLetters,
    /// Configured extra pattern (index into the list)
    Custom(usize),
}

impl SpamSignature {
    pub fn label(&self) -> &'static str {
        match self {
            SpamSignature::RepeatedChar => "repeated_char",
            SpamSignature::AlternatingRun => "alternating_run",
            SpamSignature::AllSpecial => "all_special",
            SpamSignature::AllDigits => "all_digits",
            SpamSignature::AllLetters => "all_letters",
            SpamSignature::Custom(_) => "custom",
        }
    }
}

/// Compiled spam signatures
pub struct SpamPatterns {
    builtin: bool,
    all_special: Regex,
    all_digits: Regex,
    all_letters: Regex,
    extra: Vec<Regex>,
}

impl SpamPatterns {
    /// Compile the signature set. Invalid extra patterns are skipped with a
    /// warning; `EngineConfig::validate` rejects them before this point.
    pub fn new(builtin: bool, extra_patterns: &[String]) -> Self {
        let extra = extra_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "Skipping invalid spam pattern");
                    None
                }
            })
            .collect();

        Self {
            builtin,
            all_special: compile(r"^[^\p{L}\p{N}\s]{5,}$"),
            all_digits: compile(r"^\p{N}{10,}$"),
            all_letters: compile(r"^\p{L}{20,}$"),
            extra,
        }
    }

    /// First signature the text matches, if any
    pub fn detect(&self, text: &str) -> Option<SpamSignature> {
        if self.builtin {
            let trimmed = text.trim();
            if has_repeated_run(trimmed, REPEATED_CHAR_RUN) {
                return Some(SpamSignature::RepeatedChar);
            }
            if has_alternating_run(trimmed, ALTERNATING_RUN) {
                return Some(SpamSignature::AlternatingRun);
            }
            if self.all_special.is_match(trimmed) {
                return Some(SpamSignature::AllSpecial);
            }
            if self.all_digits.is_match(trimmed) {
                return Some(SpamSignature::AllDigits);
            }
            if self.all_letters.is_match(trimmed) {
                return Some(SpamSignature::AllLetters);
            }
        }

        self.extra
            .iter()
            .position(|re| re.is_match(text))
            .map(SpamSignature::Custom)
    }
}

// The built-in expressions are constants covered by tests
fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => unreachable!("built-in spam pattern {pattern} failed to compile: {e}"),
    }
}

fn has_repeated_run(text: &str, min_run: usize) -> bool {
    let mut run = 0;
    let mut prev = None;
    for c in text.chars() {
        if c.is_whitespace() {
            run = 0;
            prev = None;
            continue;
        }
        if Some(c) == prev {
            run += 1;
        } else {
            run = 1;
            prev = Some(c);
        }
        if run >= min_run {
            return true;
        }
    }
    false
}

fn has_alternating_run(text: &str, min_run: usize) -> bool {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < min_run {
        return false;
    }

    // run = length of the current stretch where chars[i] == chars[i - 2]
    // and chars[i] != chars[i - 1]
    let mut run = 2;
    for i in 2..chars.len() {
        if chars[i] == chars[i - 2] && chars[i] != chars[i - 1] && !chars[i].is_whitespace() {
            run += 1;
            if run >= min_run {
                return true;
            }
        } else {
            run = 2;
        }
    }
    false
}
