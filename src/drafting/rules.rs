//! Outreach message rules applied to every generated draft.
//!
//! Matching is by pattern only; the rules know nothing about the lead.

use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::queue::model::MessageType;

/// Generated text may run slightly over the 30 words the prompt asks for.
pub const MAX_WORDS: usize = 35;

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DraftViolation {
    Empty,
    TooLong { words: usize, max: usize },
    /// Dashes instead of commas or periods.
    Dashes,
    /// A first message must not ask for a meeting.
    AsksForMeeting,
    Flattery { word: String },
    /// Word for word a message this lead already received.
    AlreadySent,
}

impl DraftViolation {
    /// Violations that make a draft unusable no matter what else it gets right.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Empty | Self::AlreadySent)
    }
}

impl fmt::Display for DraftViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "message is empty"),
            Self::TooLong { words, max } => write!(f, "{words} words (max {max})"),
            Self::Dashes => write!(f, "uses dashes instead of a comma or period"),
            Self::AsksForMeeting => write!(f, "first message asks for a meeting"),
            Self::Flattery { word } => write!(f, "flattery: {word}"),
            Self::AlreadySent => write!(f, "repeats a message already sent"),
        }
    }
}

/// Compiled draft rules.
#[derive(Debug, Clone)]
pub struct DraftRules {
    max_words: usize,
    dashes: Regex,
    meeting: Regex,
    flattery: Regex,
}

impl DraftRules {
    /// Compile the default rule set.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            max_words: MAX_WORDS,
            dashes: Regex::new(r"\s-\s|[–—]")?,
            // Hebrew words take attached prefixes, so they match as substrings.
            meeting: Regex::new(
                r"(?i)פגישה|להיפגש|נפגש|לקבוע|\bmeet(ing|up)?\b|\bschedule\b|\b(book|hop on) a call\b|\bcoffee\b",
            )?,
            flattery: Regex::new(
                r"(?i)מרשים|מעריץ|אוהב|נהדר|מדהים|מושלם|\bimpressive\b|\badmire\b|\bamazing\b|\bincredible\b|\bperfect\b|\blove\b",
            )?,
        })
    }

    pub fn with_max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    /// Every rule `content` breaks for a message of `message_type`.
    pub fn validate(&self, content: &str, message_type: MessageType) -> Vec<DraftViolation> {
        let mut violations = Vec::new();

        if content.trim().is_empty() {
            violations.push(DraftViolation::Empty);
            return violations;
        }

        let words = content.split_whitespace().count();
        if words > self.max_words {
            violations.push(DraftViolation::TooLong {
                words,
                max: self.max_words,
            });
        }

        if self.dashes.is_match(content) {
            violations.push(DraftViolation::Dashes);
        }

        if message_type == MessageType::FirstOutreach {
            if self.meeting.is_match(content) {
                violations.push(DraftViolation::AsksForMeeting);
            }
            if let Some(m) = self.flattery.find(content) {
                violations.push(DraftViolation::Flattery {
                    word: m.as_str().to_string(),
                });
            }
        }

        violations
    }
}
