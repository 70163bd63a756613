//! Message drafting on top of the external generator.
//!
//! Each draft is checked against [`DraftRules`] and against the messages
//! the lead already received. Invalid drafts are regenerated up to the
//! configured number of attempts, keeping the one with the fewest
//! violations. Empty or repeated text is never kept.

pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use rules::{DraftRules, DraftViolation};

use crate::error::{DraftError, ExternalError};
use crate::integrations::{DraftRequest, MessageGenerator, with_timeout};
use crate::leads::{Direction, Lead};
use crate::queue::model::MessageType;

/// A generated message and the rules it breaks.
#[derive(Debug, Clone)]
pub struct Draft {
    pub text: String,
    pub violations: Vec<DraftViolation>,
    /// Generator calls spent on this draft.
    pub attempts: u32,
}

impl Draft {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Best-of-N drafter.
pub struct Drafter {
    generator: Arc<dyn MessageGenerator>,
    rules: DraftRules,
    timeout: Duration,
    attempts: u32,
}

impl Drafter {
    pub fn new(
        generator: Arc<dyn MessageGenerator>,
        rules: DraftRules,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            generator,
            rules,
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Draft a message of `message_type` for `lead`.
    ///
    /// Returns the first valid draft, or else the usable attempt with the
    /// fewest violations. Fails if every generator call failed or came back
    /// empty or repeated.
    pub async fn draft(&self, lead: &Lead, message_type: MessageType) -> Result<Draft, DraftError> {
        let request = DraftRequest {
            profile: lead.profile.clone(),
            history: lead.history.clone(),
            message_type,
        };

        let mut best: Option<Draft> = None;
        let mut unusable: Option<DraftViolation> = None;
        let mut last_err: Option<ExternalError> = None;

        for attempt in 1..=self.attempts {
            let text = match with_timeout("generator", self.timeout, self.generator.draft(&request)).await {
                Ok(text) => text.trim().to_string(),
                Err(e) => {
                    warn!(lead_id = %lead.id, attempt, error = %e, "Draft generation failed");
                    last_err = Some(e);
                    continue;
                }
            };

            let mut violations = self.rules.validate(&text, message_type);
            if !text.is_empty() && already_sent(lead, &text) {
                violations.push(DraftViolation::AlreadySent);
            }
            let draft = Draft {
                text,
                violations,
                attempts: attempt,
            };

            if draft.is_valid() {
                info!(lead_id = %lead.id, %message_type, attempt, "Draft accepted");
                return Ok(draft);
            }

            debug!(
                lead_id = %lead.id,
                attempt,
                violations = ?draft.violations,
                "Draft broke outreach rules"
            );

            if let Some(blocking) = draft.violations.iter().find(|v| v.is_blocking()) {
                unusable = Some(blocking.clone());
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|b| draft.violations.len() < b.violations.len())
            {
                best = Some(draft);
            }
        }

        match (best, unusable, last_err) {
            (Some(mut draft), _, _) => {
                draft.attempts = self.attempts;
                warn!(
                    lead_id = %lead.id,
                    violations = ?draft.violations,
                    "No valid draft; keeping best attempt"
                );
                Ok(draft)
            }
            (None, Some(DraftViolation::AlreadySent), _) => Err(DraftError::AlreadySent),
            (None, Some(_), _) => Err(DraftError::Empty),
            (None, None, Some(source)) => Err(DraftError::Generator {
                attempts: self.attempts,
                source,
            }),
            (None, None, None) => Err(DraftError::Empty),
        }
    }
}

fn already_sent(lead: &Lead, text: &str) -> bool {
    lead.history
        .iter()
        .any(|m| m.direction == Direction::Outbound && m.content.trim() == text)
}
