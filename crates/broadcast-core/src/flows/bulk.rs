// Bulk flow (spec §4.5.2): collecting → processing (internal) →
// awaiting_batch_action. Started by `/bulk [1|2|3]`, collects forwarded
// catalog messages, generates a draft per item, then fires or schedules
// the batch as one unit.

use super::{FlowContext, FlowOutcome, Reply, SideEffect};
use crate::ai_client::ParseOutcome;
use crate::error::EngineResult;
use crate::flow_state::{BulkItem, BulkState, BulkStep};
use crate::parser::{self, ParsedCommand};
use crate::types::{ChatTarget, Draft, Level, MediaHandle, ParsedItem, Supplier};
use chrono::Utc;

/// Rolling inactivity timeout for the collecting step (spec §4.5.2).
pub const COLLECTING_TIMEOUT_MINUTES: i64 = 2;

/// Default `schedule(target, minutes)` spacing when the operator gives no
/// explicit argument (spec §4.5.2) — distinct from Forward/Research/
/// Caption's 47-minute default, which the Bulk batch-schedule command does
/// not share.
pub const DEFAULT_BULK_SCHEDULE_MINUTES: u32 = 30;

pub fn start(level: Option<Level>) -> FlowOutcome<BulkState> {
    let now = Utc::now();
    let state = BulkState {
        step: BulkStep::Collecting,
        history: Vec::new(),
        created_at: now,
        last_activity: now,
        level: level.unwrap_or(Level::Persuasive),
        items: Vec::new(),
        drafts: Vec::new(),
        parsed_items: Vec::new(),
        selected_indices: None,
    };
    FlowOutcome::reply_only(
        vec![Reply::text("Bulk collection started. Forward catalog messages, then send /done.")],
        state,
    )
}

/// Append a forwarded message while collecting (spec §4.5.2).
pub fn add_item(mut state: BulkState, raw_text: String, media: Vec<MediaHandle>) -> FlowOutcome<BulkState> {
    state.items.push(BulkItem { raw_text, media });
    state.last_activity = Utc::now();
    let n = state.items.len();
    FlowOutcome::reply_only(vec![Reply::text(format!("\u{2713} {n}"))], state)
}

pub fn is_expired(state: &BulkState) -> bool {
    Utc::now() - state.last_activity > chrono::Duration::minutes(COLLECTING_TIMEOUT_MINUTES)
}

/// `/done` (or collecting-timer expiry): compute ParsedItems/Drafts for
/// every collected item in order; a failure marks that slot `None` but does
/// not stop the batch.
pub async fn finish_collecting(ctx: &FlowContext<'_>, mut state: BulkState) -> EngineResult<FlowOutcome<BulkState>> {
    state.step = BulkStep::Processing;
    let mut drafts = Vec::with_capacity(state.items.len());
    let mut parsed_items = Vec::with_capacity(state.items.len());
    for item in &state.items {
        match generate_one(ctx, item, state.level).await {
            Some((parsed, draft)) => {
                parsed_items.push(Some(parsed));
                drafts.push(Some(draft));
            }
            None => {
                parsed_items.push(None);
                drafts.push(None);
            }
        }
    }
    state.drafts = drafts;
    state.parsed_items = parsed_items;
    state.step = BulkStep::AwaitingBatchAction;

    let preview = state
        .drafts
        .iter()
        .enumerate()
        .map(|(i, d)| match d {
            Some(draft) => {
                let snippet: String = draft.body.chars().take(200).collect();
                format!("{}. {}", i + 1, snippet)
            }
            None => format!("{}. (failed to generate)", i + 1),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok(FlowOutcome::reply_only(
        vec![Reply::text(format!("Batch ready:\n\n{preview}\n\nYES to send, YES DEV for dev, SCHEDULE [mins], or a number list to restrict, CANCEL"))],
        state,
    ))
}

async fn generate_one(ctx: &FlowContext<'_>, item: &BulkItem, level: Level) -> Option<(ParsedItem, Draft)> {
    // Bulk items don't ask a supplier question; FGB is the default shape for
    // unattended batches (spec §4.5.2 does not distinguish suppliers here).
    let parsed = match ctx.ai.parse(&item.raw_text, item.media.len(), Supplier::Fgb.as_tag()).await {
        Ok(ParseOutcome::Complete(item)) => item,
        _ => return None,
    };
    let body = ctx.ai.generate(&parsed, level, None).await.ok()?;
    let draft = Draft { body, level, preview_links: parsed.preview_links.clone(), cover: item.media.first().cloned() };
    Some((parsed, draft))
}

pub fn handle(mut state: BulkState, raw: &str) -> EngineResult<FlowOutcome<BulkState>> {
    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => {
            let all_media: Vec<MediaHandle> = state.items.iter().flat_map(|i| i.media.clone()).collect();
            Ok(FlowOutcome::terminate_and_release(all_media))
        }
        Ok(ParsedCommand::Send { target }) => Ok(batch_send(state, target)),
        Ok(ParsedCommand::Schedule { target, interval_minutes }) => {
            Ok(batch_schedule(state, target, interval_minutes.unwrap_or(DEFAULT_BULK_SCHEDULE_MINUTES)))
        }
        Ok(ParsedCommand::Numeric(set)) => {
            let indices: Vec<usize> = set.iter().filter(|&&n| n >= 1).map(|&n| n as usize - 1).collect();
            if indices.is_empty() {
                return Ok(FlowOutcome::reply_only(vec![Reply::text("Pick at least one index.")], state));
            }
            state.selected_indices = Some(indices.clone());
            Ok(FlowOutcome::reply_only(
                vec![Reply::text(format!("Selected {} item(s). YES / SCHEDULE [mins] / CANCEL.", indices.len()))],
                state,
            ))
        }
        Ok(ParsedCommand::SelectAll) => {
            state.selected_indices = None;
            Ok(FlowOutcome::reply_only(vec![Reply::text("All items selected.")], state))
        }
        _ => Ok(FlowOutcome::reply_only(
            vec![Reply::text("YES to send, YES DEV for dev, SCHEDULE [mins], or a number list to restrict, CANCEL")],
            state,
        )),
    }
}

fn selected_items(state: &BulkState) -> Vec<(ParsedItem, Draft, Vec<MediaHandle>)> {
    let indices: Vec<usize> = match &state.selected_indices {
        Some(idx) => idx.clone(),
        None => (0..state.drafts.len()).collect(),
    };
    indices
        .into_iter()
        .filter_map(|i| {
            let draft = state.drafts.get(i).cloned().flatten()?;
            let parsed = state.parsed_items.get(i).cloned().flatten()?;
            let media = state.items.get(i).map(|it| it.media.clone()).unwrap_or_default();
            Some((parsed, draft, media))
        })
        .collect()
}

fn batch_send(state: BulkState, target: ChatTarget) -> FlowOutcome<BulkState> {
    let items = selected_items(&state);
    FlowOutcome { replies: Vec::new(), next_state: None, effect: SideEffect::BulkSend { target, items } }
}

fn batch_schedule(state: BulkState, target: ChatTarget, minutes: u32) -> FlowOutcome<BulkState> {
    let items = selected_items(&state);
    FlowOutcome { replies: Vec::new(), next_state: None, effect: SideEffect::BulkSchedule { target, items, minutes } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_defaults_to_level_2() {
        let outcome = start(None);
        assert_eq!(outcome.next_state.unwrap().level, Level::Persuasive);
    }

    #[test]
    fn add_item_replies_with_running_count() {
        let state = start(Some(Level::Informative)).next_state.unwrap();
        let outcome = add_item(state, "text".into(), Vec::new());
        assert_eq!(outcome.replies[0].text, "\u{2713} 1");
    }

    #[test]
    fn bare_schedule_uses_bulk_default_not_forward_default() {
        let state = start(None).next_state.unwrap();
        let outcome = handle(state, "schedule").unwrap();
        match outcome.effect {
            SideEffect::BulkSchedule { minutes, .. } => assert_eq!(minutes, DEFAULT_BULK_SCHEDULE_MINUTES),
            other => panic!("expected BulkSchedule, got {other:?}"),
        }
    }

    #[test]
    fn expiry_after_timeout() {
        let mut state = start(None).next_state.unwrap();
        state.last_activity = Utc::now() - chrono::Duration::minutes(5);
        assert!(is_expired(&state));
    }
}
