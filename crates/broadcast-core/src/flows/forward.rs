// Forward flow (spec §4.5.1): awaiting_supplier_choice → awaiting_level →
// awaiting_draft_action, plus the awaiting_edited_text side-step for EDIT.

use super::{draft_action_menu, FlowContext, FlowOutcome, Reply, SideEffect};
use crate::ai_client::ParseOutcome;
use crate::error::EngineResult;
use crate::flow_state::{ForwardState, ForwardStep};
use crate::parser::{self, ParsedCommand};
use crate::types::{ChatTarget, Draft, MediaHandle, Supplier};
use crate::vocabulary::{self, DraftAction};
use chrono::Utc;

const SUPPLIER_PROMPT: &str = "Which supplier is this from?\n1. FGB\n2. Littlerazy";
const LEVEL_PROMPT: &str = "Pick a copywriting level:\n1. Informative\n2. Persuasive\n3. Urgent (Top Pick)";

/// FGB catalog messages carry a distinctive price-tag marker the detector
/// can use to skip the supplier prompt (spec §4.5.1 "may be skipped").
fn looks_like_fgb(text: &str) -> bool {
    text.contains('\u{1f3f7}') && text.to_lowercase().contains("nett")
}

pub fn start(raw_text: String, media: Vec<MediaHandle>) -> FlowOutcome<ForwardState> {
    let now = Utc::now();
    if looks_like_fgb(&raw_text) {
        let state = ForwardState {
            step: ForwardStep::AwaitingLevel,
            history: vec![ForwardStep::AwaitingSupplierChoice],
            created_at: now,
            raw_text,
            supplier: Some(Supplier::Fgb),
            level: None,
            parsed: None,
            draft: None,
            missing_fields: Vec::new(),
            po_prefix: false,
            media,
            image_candidates: Vec::new(),
        };
        return FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state);
    }
    let state = ForwardState {
        step: ForwardStep::AwaitingSupplierChoice,
        history: Vec::new(),
        created_at: now,
        raw_text,
        supplier: None,
        level: None,
        parsed: None,
        draft: None,
        missing_fields: Vec::new(),
        po_prefix: false,
        media,
        image_candidates: Vec::new(),
    };
    FlowOutcome::reply_only(vec![Reply::text(SUPPLIER_PROMPT)], state)
}

pub async fn handle(
    ctx: &FlowContext<'_>,
    state: ForwardState,
    raw: &str,
) -> EngineResult<FlowOutcome<ForwardState>> {
    match state.step {
        ForwardStep::AwaitingSupplierChoice => handle_supplier_choice(state, raw),
        ForwardStep::AwaitingLevel => handle_level(ctx, state, raw).await,
        ForwardStep::AwaitingDraftAction => handle_draft_action(ctx, state, raw).await,
        ForwardStep::AwaitingEditedText => handle_edited_text(state, raw),
    }
}

fn handle_supplier_choice(mut state: ForwardState, raw: &str) -> EngineResult<FlowOutcome<ForwardState>> {
    let supplier = match parser::parse(raw) {
        Ok(ParsedCommand::Numeric(set)) if set.len() == 1 => Supplier::parse(&set[0].to_string()),
        Ok(ParsedCommand::Free(text)) => Supplier::parse(&text),
        Ok(ParsedCommand::Cancel) => return Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")])),
        _ => None,
    };
    let Some(supplier) = supplier else {
        return Ok(FlowOutcome::reply_only(vec![Reply::text(SUPPLIER_PROMPT)], state));
    };
    state.supplier = Some(supplier);
    state.history.push(ForwardStep::AwaitingSupplierChoice);
    state.step = ForwardStep::AwaitingLevel;
    Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state))
}

async fn handle_level(
    ctx: &FlowContext<'_>,
    mut state: ForwardState,
    raw: &str,
) -> EngineResult<FlowOutcome<ForwardState>> {
    if !state.missing_fields.is_empty() {
        let field = state.missing_fields.remove(0);
        if !raw.trim().eq_ignore_ascii_case("/skip") {
            state.raw_text.push_str(&format!("\n{field}: {}", raw.trim()));
        }
        if let Some(next) = state.missing_fields.first().cloned() {
            return Ok(FlowOutcome::reply_only(vec![Reply::text(format!("What's the {next}? (or /skip)"))], state));
        }
        return request_parse_and_draft(ctx, state).await;
    }

    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => {
            ctx.media.release_all(&state.media);
            return Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]));
        }
        Ok(ParsedCommand::Back) => {
            state.step = ForwardStep::AwaitingSupplierChoice;
            state.level = None;
            return Ok(FlowOutcome::reply_only(vec![Reply::text(SUPPLIER_PROMPT)], state));
        }
        Ok(ParsedCommand::Numeric(set)) => {
            let Some(level) = parser::numeric_as_level(&set) else {
                return Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state));
            };
            state.level = Some(level);
            request_parse_and_draft(ctx, state).await
        }
        _ => Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state)),
    }
}

async fn request_parse_and_draft(
    ctx: &FlowContext<'_>,
    mut state: ForwardState,
) -> EngineResult<FlowOutcome<ForwardState>> {
    let supplier = state.supplier.expect("level step only reached with a supplier chosen");
    match ctx.ai.parse(&state.raw_text, state.media.len(), supplier.as_tag()).await {
        Ok(ParseOutcome::Complete(item)) => {
            state.parsed = Some(item);
            generate_draft(ctx, state, None).await
        }
        Ok(ParseOutcome::Incomplete(incomplete)) => {
            state.missing_fields = incomplete.missing_fields;
            match state.missing_fields.first().cloned() {
                Some(next) => Ok(FlowOutcome::reply_only(vec![Reply::text(format!("What's the {next}? (or /skip)"))], state)),
                None => Ok(FlowOutcome::reply_only(
                    vec![Reply::text("Still missing required details — please resend the catalog text.")],
                    state,
                )),
            }
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

async fn generate_draft(
    ctx: &FlowContext<'_>,
    mut state: ForwardState,
    user_edit: Option<&str>,
) -> EngineResult<FlowOutcome<ForwardState>> {
    let parsed = state.parsed.clone().expect("draft generation requires a parsed item");
    let level = state.level.expect("draft generation requires a chosen level");
    match ctx.ai.generate(&parsed, level, user_edit).await {
        Ok(body) => {
            let draft = Draft {
                body,
                level,
                preview_links: parsed.preview_links.clone(),
                cover: state.media.first().cloned(),
            };
            state.draft = Some(draft.clone());
            state.step = ForwardStep::AwaitingDraftAction;
            let image = state.media.first().and_then(|h| ctx.media.path_of(h));
            let reply = match image {
                Some(path) => Reply::with_image(draft.body.clone(), path),
                None => Reply::text(draft.body.clone()),
            };
            Ok(FlowOutcome::reply_only(vec![reply, Reply::text(draft_action_menu())], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

async fn handle_draft_action(
    ctx: &FlowContext<'_>,
    mut state: ForwardState,
    raw: &str,
) -> EngineResult<FlowOutcome<ForwardState>> {
    if !state.image_candidates.is_empty() {
        if let Ok(ParsedCommand::Numeric(set)) = parser::parse(raw) {
            return Ok(handle_cover_pick(state, &set));
        }
    }

    let action = match vocabulary::interpret(raw) {
        Ok(a) => a,
        Err(_) => return Ok(FlowOutcome::reply_only(vec![Reply::text(draft_action_menu())], state)),
    };

    match action {
        DraftAction::Send { target } => {
            let draft = state.draft.clone().expect("send only valid once a draft exists");
            let parsed = state.parsed.clone().expect("send only valid once a draft exists");
            let media = state.media.clone();
            Ok(FlowOutcome { replies: Vec::new(), next_state: None, effect: SideEffect::SendNow { target, parsed, draft, media } })
        }
        DraftAction::Schedule { target, interval_minutes } => {
            let draft = state.draft.clone().expect("schedule only valid once a draft exists");
            let parsed = state.parsed.clone().expect("schedule only valid once a draft exists");
            let media = state.media.clone();
            Ok(FlowOutcome {
                replies: Vec::new(),
                next_state: None,
                effect: SideEffect::ScheduleOne { target, parsed, draft, media, minutes: interval_minutes },
            })
        }
        DraftAction::Regen { hint } => generate_draft(ctx, state, hint.as_deref()).await,
        DraftAction::Cover => handle_cover_search(ctx, state).await,
        DraftAction::Links => handle_links(ctx, state).await,
        DraftAction::Edit => {
            state.step = ForwardStep::AwaitingEditedText;
            Ok(FlowOutcome::reply_only(vec![Reply::text("Send the replacement draft text.")], state))
        }
        DraftAction::Cancel => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]))
        }
        DraftAction::Back => {
            state.step = ForwardStep::AwaitingLevel;
            state.draft = None;
            Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state))
        }
        DraftAction::Restart => {
            state.step = ForwardStep::AwaitingSupplierChoice;
            state.history.clear();
            state.level = None;
            state.parsed = None;
            state.draft = None;
            state.missing_fields.clear();
            Ok(FlowOutcome::reply_only(vec![Reply::text(SUPPLIER_PROMPT)], state))
        }
        DraftAction::PoPrefix => {
            if let Some(draft) = state.draft.as_mut() {
                draft.body = super::apply_po_prefix(&draft.body);
            }
            let body = state.draft.as_ref().map(|d| d.body.clone()).unwrap_or_default();
            Ok(FlowOutcome::reply_only(vec![Reply::text(body), Reply::text(draft_action_menu())], state))
        }
        DraftAction::Numeric(_) | DraftAction::Unrecognized(_) => {
            Ok(FlowOutcome::reply_only(vec![Reply::text(draft_action_menu())], state))
        }
    }
}

/// Cover-pick handling only records the operator's choice as a reply; the
/// Router is responsible for fetching the URL into the Media Cache and
/// re-attaching it as the draft's cover handle, since it — not the flow
/// step — holds the HTTP-capable download path.
fn handle_cover_pick(mut state: ForwardState, set: &[u64]) -> FlowOutcome<ForwardState> {
    if set.len() == 1 && set[0] == 0 {
        state.image_candidates.clear();
        return FlowOutcome::reply_only(vec![Reply::text(draft_action_menu())], state);
    }
    if set.len() == 1 {
        let idx = (set[0] as usize).saturating_sub(1);
        if let Some(candidate) = state.image_candidates.get(idx).cloned() {
            state.image_candidates.clear();
            return FlowOutcome::reply_only(vec![Reply::text(format!("Using cover: {}", candidate.url))], state);
        }
    }
    FlowOutcome::reply_only(vec![Reply::text("Pick a number from the list, or 0 to keep the current cover.")], state)
}

async fn handle_cover_search(ctx: &FlowContext<'_>, mut state: ForwardState) -> EngineResult<FlowOutcome<ForwardState>> {
    let title = state.parsed.as_ref().map(|p| p.title.clone()).unwrap_or_default();
    match ctx.ai.search_images(&title, 5).await {
        Ok(images) => {
            let listing = images
                .iter()
                .enumerate()
                .map(|(i, img)| format!("{}. {}", i + 1, img.url))
                .collect::<Vec<_>>()
                .join("\n");
            state.image_candidates = images;
            Ok(FlowOutcome::reply_only(vec![Reply::text(format!("Pick a cover (0 to keep current):\n{listing}"))], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

async fn handle_links(ctx: &FlowContext<'_>, mut state: ForwardState) -> EngineResult<FlowOutcome<ForwardState>> {
    let title = state.parsed.as_ref().map(|p| p.title.clone()).unwrap_or_default();
    match ctx.ai.search_links(&title, 2).await {
        Ok(links) => {
            if let Some(draft) = state.draft.as_mut() {
                draft.body = splice_preview_links(&draft.body, &links);
                draft.preview_links = links;
            }
            let body = state.draft.as_ref().map(|d| d.body.clone()).unwrap_or_default();
            Ok(FlowOutcome::reply_only(vec![Reply::text(body), Reply::text(draft_action_menu())], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

/// Replace an existing `Preview:` block in `body` with `links`, or append one.
pub fn splice_preview_links(body: &str, links: &[String]) -> String {
    let block = if links.is_empty() { String::new() } else { format!("Preview: {}", links.join(" | ")) };
    let mut lines: Vec<String> = body.lines().map(String::from).collect();
    if let Some(pos) = lines.iter().position(|l| l.trim_start().starts_with("Preview:")) {
        if block.is_empty() {
            lines.remove(pos);
        } else {
            lines[pos] = block;
        }
        return lines.join("\n");
    }
    if block.is_empty() {
        body.to_string()
    } else {
        format!("{body}\n\n{block}")
    }
}

fn handle_edited_text(mut state: ForwardState, raw: &str) -> EngineResult<FlowOutcome<ForwardState>> {
    if let Some(draft) = state.draft.as_mut() {
        draft.body = raw.to_string();
    } else {
        state.draft = Some(Draft {
            body: raw.to_string(),
            level: state.level.unwrap_or(crate::types::Level::Persuasive),
            preview_links: Vec::new(),
            cover: state.media.first().cloned(),
        });
    }
    let draft = state.draft.clone().expect("just set above");
    let parsed = state.parsed.clone().expect("edited text only reachable after a draft was generated");
    let media = state.media.clone();
    Ok(FlowOutcome {
        replies: Vec::new(),
        next_state: None,
        effect: SideEffect::SendNow { target: ChatTarget::Production, parsed, draft, media },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fgb_marker_skips_supplier_prompt() {
        let outcome = start("\u{1f3f7} Rp 115.000 NETT".to_string(), Vec::new());
        let state = outcome.next_state.unwrap();
        assert_eq!(state.step, ForwardStep::AwaitingLevel);
        assert_eq!(state.supplier, Some(Supplier::Fgb));
    }

    #[test]
    fn plain_text_starts_at_supplier_choice() {
        let outcome = start("some catalog text".to_string(), Vec::new());
        let state = outcome.next_state.unwrap();
        assert_eq!(state.step, ForwardStep::AwaitingSupplierChoice);
    }

    #[test]
    fn splice_links_replaces_existing_block() {
        let body = "Great book!\nPreview: http://old\n\nBuy now";
        let spliced = splice_preview_links(body, &["http://new".to_string()]);
        assert!(spliced.contains("Preview: http://new"));
        assert!(!spliced.contains("http://old"));
    }

    #[test]
    fn splice_links_appends_when_absent() {
        let body = "Great book!";
        let spliced = splice_preview_links(body, &["http://new".to_string()]);
        assert!(spliced.contains("Preview: http://new"));
    }
}
