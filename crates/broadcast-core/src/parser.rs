// Command Parser (spec §4.1) — normalizes raw operator text into a single
// disjoint command value. Grounded on the teacher's preference for small,
// exhaustive enums over stringly-typed dispatch (ProviderKind, RunStatus in
// engine/state.rs / engine/types.rs) and on channels/access.rs's style of
// ordered, early-return rule application.

use crate::types::ChatTarget;
use regex::Regex;
use std::sync::LazyLock;

static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\d,\s]+$").unwrap());

/// Default schedule interval (minutes) applied by Forward/Research/Caption's
/// `awaiting_draft_action` SCHEDULE command when the operator gives no
/// explicit argument (spec §4.5.1). Bulk's `schedule(target, minutes)` uses
/// its own default (spec §4.5.2) — see `flows::bulk::DEFAULT_BULK_SCHEDULE_MINUTES`.
pub const DEFAULT_SCHEDULE_MINUTES: u32 = 47;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// `/word rest-of-line` — head is lower-cased, argument keeps original case.
    Slash { command: String, argument: String },
    Send { target: ChatTarget },
    /// `None` means the operator gave no explicit interval — callers apply
    /// their own context-appropriate default rather than the parser guessing.
    Schedule { target: ChatTarget, interval_minutes: Option<u32> },
    SelectAll,
    Cancel,
    Edit,
    Regen { hint: Option<String> },
    Cover,
    Links,
    Back,
    Restart,
    /// Deduplicated, order-preserving set of positive integers.
    Numeric(Vec<u64>),
    Free(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("schedule interval must be an integer between 1 and 1440 minutes")]
    ScheduleIntervalOutOfRange,
}

/// Parse one line of operator input. Total over all inputs: every string
/// maps to exactly one `ParsedCommand` or one `ParseError` (spec §8 #5).
pub fn parse(raw: &str) -> Result<ParsedCommand, ParseError> {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();

    // Rule 1 — slash commands are taken verbatim (argument keeps case).
    if let Some(rest) = trimmed.strip_prefix('/') {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_lowercase();
        let argument = parts.next().unwrap_or("").trim().to_string();
        return Ok(ParsedCommand::Slash { command, argument });
    }

    // Rule 2 — send shorthand.
    if lower == "yes dev" || lower == "y dev" {
        return Ok(ParsedCommand::Send { target: ChatTarget::Dev });
    }
    if lower == "yes" || lower == "y" || lower == "ya" || lower == "iya" {
        return Ok(ParsedCommand::Send { target: ChatTarget::Production });
    }
    if lower == "all" {
        return Ok(ParsedCommand::SelectAll);
    }

    // Rule 3 — schedule, with dev/production target and optional interval.
    if let Some(arg) = strip_any_prefix(&lower, &["schedule dev"]) {
        return schedule_command(ChatTarget::Dev, arg);
    }
    if let Some(arg) = strip_any_prefix(&lower, &["schedule", "antri", "nanti"]) {
        return schedule_command(ChatTarget::Production, arg);
    }

    // Rule 4 — cancel.
    if lower == "cancel" || lower.contains("batal") || lower.contains("skip") {
        return Ok(ParsedCommand::Cancel);
    }

    // Rule 5 — edit.
    if lower == "edit" || lower.contains("ubah") || lower.contains("ganti") {
        return Ok(ParsedCommand::Edit);
    }

    // Rule 6 — regen (bare token only; hint extraction is a vocabulary-level
    // concern applied to Free text, see `vocabulary::interpret_draft_action`).
    if lower == "regen" || lower.contains("ulang") {
        return Ok(ParsedCommand::Regen { hint: None });
    }

    // Rule 7 — cover / links.
    if lower == "cover" {
        return Ok(ParsedCommand::Cover);
    }
    if lower == "links" || lower == "link" {
        return Ok(ParsedCommand::Links);
    }

    // Rule 8 — back / restart.
    if lower == "0" || lower == "back" || lower == "kembali" || lower == "balik" {
        return Ok(ParsedCommand::Back);
    }
    if lower == "restart" || lower == "ulang semua" {
        return Ok(ParsedCommand::Restart);
    }

    // Rule 9 — numeric selection.
    if NUMERIC_RE.is_match(&lower) {
        let mut seen = std::collections::HashSet::new();
        let mut ordered = Vec::new();
        for tok in lower.split(|c: char| c == ',' || c.is_whitespace()) {
            if tok.is_empty() {
                continue;
            }
            if let Ok(n) = tok.parse::<u64>() {
                if n > 0 && seen.insert(n) {
                    ordered.push(n);
                }
            }
        }
        if !ordered.is_empty() {
            return Ok(ParsedCommand::Numeric(ordered));
        }
        // Empty set after filtering falls through to Free, per spec §4.1 rule 9.
    }

    // Rule 10 — everything else is free text (original casing preserved).
    Ok(ParsedCommand::Free(trimmed.to_string()))
}

fn strip_any_prefix<'a>(lower: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    for p in prefixes {
        if lower == *p {
            return Some("");
        }
        if let Some(rest) = lower.strip_prefix(p) {
            if rest.starts_with(char::is_whitespace) {
                return Some(rest.trim());
            }
        }
    }
    None
}

fn schedule_command(target: ChatTarget, arg: &str) -> Result<ParsedCommand, ParseError> {
    if arg.is_empty() {
        return Ok(ParsedCommand::Schedule { target, interval_minutes: None });
    }
    let interval = arg.parse::<u32>().map_err(|_| ParseError::ScheduleIntervalOutOfRange)?;
    if interval < 1 || interval > 1440 {
        return Err(ParseError::ScheduleIntervalOutOfRange);
    }
    Ok(ParsedCommand::Schedule { target, interval_minutes: Some(interval) })
}

/// A `Numeric` parse is also the level chooser: accepted only when the set
/// is exactly `{1}`, `{2}`, or `{3}` (spec §4.1, last paragraph).
pub fn numeric_as_level(set: &[u64]) -> Option<crate::types::Level> {
    if set.len() == 1 {
        crate::types::Level::from_u8(set[0] as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_splits_head_and_argument() {
        assert_eq!(
            parse("/setmarkup 1500").unwrap(),
            ParsedCommand::Slash { command: "setmarkup".into(), argument: "1500".into() }
        );
    }

    #[test]
    fn yes_variants() {
        for w in ["yes", "y", "ya", "iya", "YES", " Yes "] {
            assert_eq!(parse(w).unwrap(), ParsedCommand::Send { target: ChatTarget::Production });
        }
        assert_eq!(parse("yes dev").unwrap(), ParsedCommand::Send { target: ChatTarget::Dev });
        assert_eq!(parse("Y DEV").unwrap(), ParsedCommand::Send { target: ChatTarget::Dev });
    }

    #[test]
    fn schedule_defaults_and_targets() {
        assert_eq!(
            parse("schedule").unwrap(),
            ParsedCommand::Schedule { target: ChatTarget::Production, interval_minutes: None }
        );
        assert_eq!(
            parse("SCHEDULE 30").unwrap(),
            ParsedCommand::Schedule { target: ChatTarget::Production, interval_minutes: Some(30) }
        );
        assert_eq!(
            parse("schedule dev 5").unwrap(),
            ParsedCommand::Schedule { target: ChatTarget::Dev, interval_minutes: Some(5) }
        );
        assert_eq!(
            parse("antri 10").unwrap(),
            ParsedCommand::Schedule { target: ChatTarget::Production, interval_minutes: Some(10) }
        );
    }

    #[test]
    fn schedule_rejects_out_of_range() {
        assert_eq!(parse("schedule 0"), Err(ParseError::ScheduleIntervalOutOfRange));
        assert_eq!(parse("schedule 1441"), Err(ParseError::ScheduleIntervalOutOfRange));
        assert!(parse("schedule 1").is_ok());
        assert!(parse("schedule 1440").is_ok());
    }

    #[test]
    fn cancel_synonyms() {
        assert_eq!(parse("cancel").unwrap(), ParsedCommand::Cancel);
        assert_eq!(parse("batal dong").unwrap(), ParsedCommand::Cancel);
        assert_eq!(parse("skip it").unwrap(), ParsedCommand::Cancel);
    }

    #[test]
    fn numeric_dedup_preserves_order() {
        assert_eq!(parse("1, ,2").unwrap(), ParsedCommand::Numeric(vec![1, 2]));
        assert_eq!(parse("2 2 1").unwrap(), ParsedCommand::Numeric(vec![2, 1]));
    }

    #[test]
    fn numeric_empty_falls_through_to_free() {
        assert_eq!(parse(", ,").unwrap(), ParsedCommand::Free(", ,".into()));
    }

    #[test]
    fn level_chooser_only_accepts_single_valid_digit() {
        assert_eq!(numeric_as_level(&[2]), Some(crate::types::Level::Persuasive));
        assert_eq!(numeric_as_level(&[4]), None);
        assert_eq!(numeric_as_level(&[1, 2]), None);
    }

    #[test]
    fn back_and_restart() {
        assert_eq!(parse("0").unwrap(), ParsedCommand::Back);
        assert_eq!(parse("kembali").unwrap(), ParsedCommand::Back);
        assert_eq!(parse("restart").unwrap(), ParsedCommand::Restart);
    }

    #[test]
    fn free_text_is_total_fallback() {
        assert_eq!(parse("hello there").unwrap(), ParsedCommand::Free("hello there".into()));
    }
}
