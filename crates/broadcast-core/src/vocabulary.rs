// Draft Action Vocabulary (spec §2 item 2, §4.5.5) — maps action tokens to
// one uniform command consumed by every flow's `awaiting_draft_action` step.
// Built once on top of the Command Parser's output, per the teacher's design
// note pattern of a single shared helper reused across N near-identical
// call sites (engine/channels/mod.rs's `run_channel_agent`, reused by every
// channel bridge).

use crate::parser::{self, ParseError, ParsedCommand};
use crate::types::ChatTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftAction {
    Send { target: ChatTarget },
    Schedule { target: ChatTarget, interval_minutes: u32 },
    Regen { hint: Option<String> },
    Cover,
    Links,
    Edit,
    Cancel,
    Back,
    Restart,
    /// `PO` menu item — prefixes the draft body with a fixed phrase (spec §4.5.5).
    PoPrefix,
    /// A numeric pick inside a sub-step (cover image index, research candidate, 0=abandon).
    Numeric(Vec<u64>),
    /// Anything the vocabulary doesn't recognize as an action — the caller
    /// decides what to do with free text at this step (e.g. `edit`'s body).
    Unrecognized(String),
}

/// Interpret one line of operator input as a draft-action command.
/// Shared verbatim by Forward, Bulk, Research, and Caption at their
/// `awaiting_draft_action` step.
pub fn interpret(raw: &str) -> Result<DraftAction, ParseError> {
    match parser::parse(raw)? {
        ParsedCommand::Send { target } => Ok(DraftAction::Send { target }),
        ParsedCommand::Schedule { target, interval_minutes } => {
            Ok(DraftAction::Schedule { target, interval_minutes: interval_minutes.unwrap_or(parser::DEFAULT_SCHEDULE_MINUTES) })
        }
        ParsedCommand::Regen { hint } => Ok(DraftAction::Regen { hint }),
        ParsedCommand::Cover => Ok(DraftAction::Cover),
        ParsedCommand::Links => Ok(DraftAction::Links),
        ParsedCommand::Edit => Ok(DraftAction::Edit),
        ParsedCommand::Cancel => Ok(DraftAction::Cancel),
        ParsedCommand::Back => Ok(DraftAction::Back),
        ParsedCommand::Restart => Ok(DraftAction::Restart),
        ParsedCommand::Numeric(set) => Ok(DraftAction::Numeric(set)),
        ParsedCommand::SelectAll => Ok(DraftAction::Numeric(Vec::new())),
        ParsedCommand::Slash { command, argument } => {
            if command == "skip" {
                Ok(DraftAction::Cancel)
            } else {
                Ok(DraftAction::Unrecognized(format!("/{command} {argument}")))
            }
        }
        ParsedCommand::Free(text) => {
            if let Some(rest) = strip_regen_prefix(&text) {
                let hint = rest.trim();
                let hint = hint.strip_prefix(':').unwrap_or(hint).trim();
                return Ok(DraftAction::Regen {
                    hint: if hint.is_empty() { None } else { Some(hint.to_string()) },
                });
            }
            if text.trim().eq_ignore_ascii_case("po") {
                return Ok(DraftAction::PoPrefix);
            }
            Ok(DraftAction::Unrecognized(text))
        }
    }
}

/// `REGEN: too long` / `regen too long` — a free-text line beginning with
/// the regen token carries an inline `user_edit` hint (spec §4.5.1, open
/// question #2: unified as "forward the text verbatim to `user_edit`").
fn strip_regen_prefix(text: &str) -> Option<&str> {
    let lower = text.to_lowercase();
    if lower.starts_with("regen") {
        Some(&text[5..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tokens_map_through() {
        assert_eq!(interpret("cover").unwrap(), DraftAction::Cover);
        assert_eq!(interpret("links").unwrap(), DraftAction::Links);
        assert_eq!(interpret("cancel").unwrap(), DraftAction::Cancel);
        assert_eq!(interpret("0").unwrap(), DraftAction::Back);
    }

    #[test]
    fn regen_with_hint() {
        assert_eq!(
            interpret("REGEN: too long").unwrap(),
            DraftAction::Regen { hint: Some("too long".into()) }
        );
        assert_eq!(interpret("regen").unwrap(), DraftAction::Regen { hint: None });
    }

    #[test]
    fn po_prefix_token() {
        assert_eq!(interpret("PO").unwrap(), DraftAction::PoPrefix);
    }

    #[test]
    fn unrecognized_free_text_passes_through() {
        assert_eq!(
            interpret("what does this mean").unwrap(),
            DraftAction::Unrecognized("what does this mean".into())
        );
    }
}
