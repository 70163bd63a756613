//! Lead state transitions driven by inbound events.

use crate::leads::LeadState;

/// State a lead moves to when a reply arrives, if any. Only the first reply
/// of a conversation moves it.
pub fn on_reply(state: LeadState) -> Option<LeadState> {
    match state {
        LeadState::New | LeadState::Contacted => Some(LeadState::InConversation),
        _ => None,
    }
}

/// State a lead moves to when a meeting is confirmed.
pub fn on_booking(state: LeadState) -> Option<LeadState> {
    match state {
        LeadState::InConversation => Some(LeadState::MeetingScheduled),
        _ => None,
    }
}

/// Whether an inbound reply means we owe the lead a message.
pub fn reply_owed(state: LeadState) -> bool {
    state == LeadState::InConversation
}

/// Outcomes only a human can signal.
pub fn is_human_outcome(state: LeadState) -> bool {
    matches!(state, LeadState::NotInterested | LeadState::Won)
}
