// Research flow (spec §4.5.3): /new <query> → awaiting_selection →
// awaiting_details → awaiting_level → awaiting_draft_action, with an
// awaiting_image_choice side-step reachable via COVER.

use super::{FlowContext, FlowOutcome, Reply, SideEffect};
use crate::ai_client::ParseOutcome;
use crate::error::EngineResult;
use crate::flow_state::{Details, ResearchState, ResearchStep};
use crate::media::MediaOwner;
use crate::parser::{self, ParsedCommand};
use crate::types::{BookSearchResult, Draft, ParsedItem};
use crate::vocabulary::{self, DraftAction};
use chrono::Utc;

const SELECTION_PROMPT: &str = "Pick a number, or /cancel.";
const DETAILS_PROMPT: &str = "Send the price, format, ETA (e.g. \"115000 hb apr 26\").";
const LEVEL_PROMPT: &str = "Pick a copywriting level:\n1. Informative\n2. Persuasive\n3. Urgent (Top Pick)";
const MAX_CANDIDATES_REQUESTED: u32 = 8;
const MAX_CANDIDATES_SHOWN: usize = 5;

/// Case-folded, alphanumeric-only key used to dedupe search results that
/// differ only by punctuation or casing (spec §4.5.3).
fn title_key(title: &str) -> String {
    title.chars().filter(|c| c.is_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}

fn dedupe_candidates(results: Vec<BookSearchResult>) -> Vec<BookSearchResult> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for r in results {
        let key = title_key(&r.title);
        if seen.insert(key) {
            out.push(r);
        }
        if out.len() >= MAX_CANDIDATES_SHOWN {
            break;
        }
    }
    out
}

fn candidate_listing(candidates: &[BookSearchResult]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let publisher = c.publisher.as_deref().unwrap_or("unknown publisher");
            format!("{}. {} ({})", i + 1, c.title, publisher)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `/new <query>`.
pub async fn start(ctx: &FlowContext<'_>, query: String) -> EngineResult<FlowOutcome<ResearchState>> {
    let now = Utc::now();
    let results = match ctx.ai.research(&query, MAX_CANDIDATES_REQUESTED).await {
        Ok(r) => r,
        Err(e) => {
            return Ok(FlowOutcome::terminate(vec![Reply::text(e.friendly_ai_message())]));
        }
    };
    let candidates = dedupe_candidates(results);
    if candidates.is_empty() {
        return Ok(FlowOutcome::terminate(vec![Reply::text("No results found for that query.")]));
    }

    let state = ResearchState {
        step: ResearchStep::AwaitingSelection,
        history: Vec::new(),
        created_at: now,
        query,
        candidates: candidates.clone(),
        selected: None,
        display_title: None,
        enriched_description: None,
        cover: None,
        details: None,
        level: None,
        parsed: None,
        draft: None,
        image_candidates: Vec::new(),
        po_prefix: false,
        media: Vec::new(),
    };

    let mut replies: Vec<Reply> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let publisher = c.publisher.as_deref().unwrap_or("unknown publisher");
            let cover_note = c.cover_url.as_deref().map(|u| format!("\ncover: {u}")).unwrap_or_default();
            Reply::text(format!("{}. {} ({}){}", i + 1, c.title, publisher, cover_note))
        })
        .collect();
    replies.push(Reply::text(format!("{}\n\n{SELECTION_PROMPT}", candidate_listing(&candidates))));
    Ok(FlowOutcome::reply_only(replies, state))
}

pub async fn handle(
    ctx: &FlowContext<'_>,
    state: ResearchState,
    raw: &str,
) -> EngineResult<FlowOutcome<ResearchState>> {
    match state.step {
        ResearchStep::AwaitingSelection => handle_selection(ctx, state, raw).await,
        ResearchStep::AwaitingDetails => handle_details(ctx, state, raw).await,
        ResearchStep::AwaitingLevel => handle_level(ctx, state, raw).await,
        ResearchStep::AwaitingDraftAction => handle_draft_action(ctx, state, raw).await,
        ResearchStep::AwaitingImageChoice => Ok(handle_image_choice(state, raw)),
        ResearchStep::AwaitingEditedText => handle_edited_text(state, raw),
    }
}

async fn handle_selection(
    ctx: &FlowContext<'_>,
    mut state: ResearchState,
    raw: &str,
) -> EngineResult<FlowOutcome<ResearchState>> {
    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")])),
        Ok(ParsedCommand::Numeric(set)) if set.len() == 1 => {
            let idx = (set[0] as usize).saturating_sub(1);
            let Some(candidate) = state.candidates.get(idx).cloned() else {
                return Ok(FlowOutcome::reply_only(vec![Reply::text(SELECTION_PROMPT)], state));
            };
            state.selected = Some(candidate.clone());

            let display_title = ctx
                .ai
                .display_title(&candidate.title, candidate.source_url.as_deref(), candidate.publisher.as_deref())
                .await
                .unwrap_or_else(|_| candidate.title.clone());
            state.display_title = Some(display_title.clone());

            let enriched = ctx.ai.research_enrich(&display_title, "", 3).await.unwrap_or_default();
            state.enriched_description = Some(enriched);

            if let Some(cover_url) = candidate.cover_url.as_deref() {
                if let Ok(bytes) = super::fetch_bytes(cover_url).await {
                    let ext = cover_url.rsplit('.').next().filter(|e| e.len() <= 4).unwrap_or("jpg");
                    if let Ok((handle, _)) = ctx.media.acquire(&bytes, ext) {
                        ctx.media.attach(&handle, MediaOwner::Flow { operator: String::new(), kind: "research" });
                        state.media.push(handle.clone());
                        state.cover = Some(handle);
                    }
                }
            }

            state.step = ResearchStep::AwaitingDetails;
            Ok(FlowOutcome::reply_only(vec![Reply::text(DETAILS_PROMPT)], state))
        }
        _ => Ok(FlowOutcome::reply_only(vec![Reply::text(SELECTION_PROMPT)], state)),
    }
}

async fn handle_details(
    ctx: &FlowContext<'_>,
    mut state: ResearchState,
    raw: &str,
) -> EngineResult<FlowOutcome<ResearchState>> {
    let _ = ctx;
    match super::parse_details(raw) {
        Ok(details) => {
            state.details = Some(details);
            state.step = ResearchStep::AwaitingLevel;
            Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.to_string())], state)),
    }
}

async fn handle_level(
    ctx: &FlowContext<'_>,
    mut state: ResearchState,
    raw: &str,
) -> EngineResult<FlowOutcome<ResearchState>> {
    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]))
        }
        Ok(ParsedCommand::Back) => {
            state.step = ResearchStep::AwaitingDetails;
            Ok(FlowOutcome::reply_only(vec![Reply::text(DETAILS_PROMPT)], state))
        }
        Ok(ParsedCommand::Numeric(set)) => {
            let Some(level) = parser::numeric_as_level(&set) else {
                return Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state));
            };
            state.level = Some(level);
            generate_draft(ctx, state, None).await
        }
        _ => Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state)),
    }
}

async fn generate_draft(
    ctx: &FlowContext<'_>,
    mut state: ResearchState,
    user_edit: Option<&str>,
) -> EngineResult<FlowOutcome<ResearchState>> {
    let selected = state.selected.clone().expect("draft generation requires a selected candidate");
    let details = state.details.clone().unwrap_or_default();
    let level = state.level.expect("draft generation requires a chosen level");

    match ctx
        .ai
        .research_generate(
            &selected,
            details.price_main,
            details.format,
            details.eta.as_deref(),
            details.close_date.as_deref(),
            details.min_order,
            level,
            user_edit,
        )
        .await
    {
        Ok(body) => {
            // ResearchState keeps a ParsedItem mirror so a Send/Schedule side
            // effect can persist a BroadcastRecord the same way every other
            // flow does, even though Research never calls `ai.parse`.
            let title = state.display_title.clone().unwrap_or_else(|| selected.title.clone());
            let title_clean = title_key(&title);
            let parsed = ParsedItem {
                title: title.clone(),
                title_clean,
                publisher: selected.publisher.clone(),
                format: details.format,
                price_main: details.price_main,
                price_secondary: None,
                currency_markup: ctx.config.currency_markup,
                eta: details.eta.clone(),
                close_date: details.close_date.clone(),
                min_order: details.min_order,
                stock: None,
                pages: None,
                item_type: None,
                description_source: state.enriched_description.clone().unwrap_or_default(),
                tags: Vec::new(),
                preview_links: Vec::new(),
                separator_mark: None,
                media_refs: state.media.clone(),
                ai_fallback: false,
            };
            state.parsed = Some(parsed.clone());
            let draft = Draft { body, level, preview_links: parsed.preview_links.clone(), cover: state.cover.clone() };
            state.draft = Some(draft.clone());
            state.step = ResearchStep::AwaitingDraftAction;
            let image = state.cover.as_ref().and_then(|h| ctx.media.path_of(h));
            let reply = match image {
                Some(path) => Reply::with_image(draft.body.clone(), path),
                None => Reply::text(draft.body.clone()),
            };
            Ok(FlowOutcome::reply_only(vec![reply, Reply::text(super::draft_action_menu())], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

async fn handle_draft_action(
    ctx: &FlowContext<'_>,
    mut state: ResearchState,
    raw: &str,
) -> EngineResult<FlowOutcome<ResearchState>> {
    let action = match vocabulary::interpret(raw) {
        Ok(a) => a,
        Err(_) => return Ok(FlowOutcome::reply_only(vec![Reply::text(super::draft_action_menu())], state)),
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
            state.step = ResearchStep::AwaitingEditedText;
            Ok(FlowOutcome::reply_only(vec![Reply::text("Send the replacement draft text.")], state))
        }
        DraftAction::Cancel => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]))
        }
        DraftAction::Back => {
            state.step = ResearchStep::AwaitingLevel;
            state.draft = None;
            Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state))
        }
        DraftAction::Restart => Ok(FlowOutcome::terminate_and_release(state.media.clone())),
        DraftAction::PoPrefix => {
            if let Some(draft) = state.draft.as_mut() {
                draft.body = super::apply_po_prefix(&draft.body);
            }
            let body = state.draft.as_ref().map(|d| d.body.clone()).unwrap_or_default();
            Ok(FlowOutcome::reply_only(vec![Reply::text(body), Reply::text(super::draft_action_menu())], state))
        }
        DraftAction::Numeric(_) | DraftAction::Unrecognized(_) => {
            Ok(FlowOutcome::reply_only(vec![Reply::text(super::draft_action_menu())], state))
        }
    }
}

async fn handle_cover_search(ctx: &FlowContext<'_>, mut state: ResearchState) -> EngineResult<FlowOutcome<ResearchState>> {
    let title = state.display_title.clone().unwrap_or_default();
    match ctx.ai.search_images(&title, 5).await {
        Ok(images) => {
            let listing = images.iter().enumerate().map(|(i, img)| format!("{}. {}", i + 1, img.url)).collect::<Vec<_>>().join("\n");
            state.image_candidates = images;
            state.history.push(ResearchStep::AwaitingDraftAction);
            state.step = ResearchStep::AwaitingImageChoice;
            Ok(FlowOutcome::reply_only(vec![Reply::text(format!("Pick a cover (0 to keep current):\n{listing}"))], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

/// Only records which candidate was picked; the Router downloads the URL
/// into the Media Cache (same division of labor as the Forward flow).
fn handle_image_choice(mut state: ResearchState, raw: &str) -> FlowOutcome<ResearchState> {
    let back_to = state.history.pop().unwrap_or(ResearchStep::AwaitingDraftAction);
    match parser::parse(raw) {
        Ok(ParsedCommand::Numeric(set)) if set.len() == 1 && set[0] == 0 => {
            state.image_candidates.clear();
            state.step = back_to;
            FlowOutcome::reply_only(vec![Reply::text(super::draft_action_menu())], state)
        }
        Ok(ParsedCommand::Numeric(set)) if set.len() == 1 => {
            let idx = (set[0] as usize).saturating_sub(1);
            if let Some(candidate) = state.image_candidates.get(idx).cloned() {
                state.image_candidates.clear();
                state.step = back_to;
                return FlowOutcome::reply_only(vec![Reply::text(format!("Using cover: {}", candidate.url))], state);
            }
            FlowOutcome::reply_only(vec![Reply::text("Pick a number from the list, or 0 to keep the current cover.")], state)
        }
        _ => FlowOutcome::reply_only(vec![Reply::text("Pick a number from the list, or 0 to keep the current cover.")], state),
    }
}

async fn handle_links(ctx: &FlowContext<'_>, mut state: ResearchState) -> EngineResult<FlowOutcome<ResearchState>> {
    let title = state.display_title.clone().unwrap_or_default();
    match ctx.ai.search_links(&title, 2).await {
        Ok(links) => {
            if let Some(draft) = state.draft.as_mut() {
                draft.body = super::forward::splice_preview_links(&draft.body, &links);
                draft.preview_links = links;
            }
            let body = state.draft.as_ref().map(|d| d.body.clone()).unwrap_or_default();
            Ok(FlowOutcome::reply_only(vec![Reply::text(body), Reply::text(super::draft_action_menu())], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

fn handle_edited_text(mut state: ResearchState, raw: &str) -> EngineResult<FlowOutcome<ResearchState>> {
    if let Some(draft) = state.draft.as_mut() {
        draft.body = raw.to_string();
    } else {
        state.draft = Some(Draft {
            body: raw.to_string(),
            level: state.level.unwrap_or(crate::types::Level::Persuasive),
            preview_links: Vec::new(),
            cover: state.cover.clone(),
        });
    }
    let draft = state.draft.clone().expect("just set above");
    let parsed = state.parsed.clone().expect("edited text only reachable after a draft was generated");
    let media = state.media.clone();
    Ok(FlowOutcome {
        replies: Vec::new(),
        next_state: None,
        effect: SideEffect::SendNow { target: crate::types::ChatTarget::Production, parsed, draft, media },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str) -> BookSearchResult {
        BookSearchResult { title: title.into(), publisher: Some("Pub".into()), source_url: None, cover_url: None }
    }

    #[test]
    fn title_key_folds_case_and_punctuation() {
        assert_eq!(title_key("The Great Gatsby!"), title_key("the great gatsby"));
    }

    #[test]
    fn dedupe_keeps_first_five_distinct_titles() {
        let mut results = Vec::new();
        for i in 0..10 {
            results.push(candidate(&format!("Book {i}")));
        }
        results.push(candidate("Book 0")); // duplicate
        let deduped = dedupe_candidates(results);
        assert_eq!(deduped.len(), MAX_CANDIDATES_SHOWN);
    }

    #[test]
    fn dedupe_drops_case_and_punctuation_duplicates() {
        let results = vec![candidate("Moby Dick"), candidate("MOBY DICK!"), candidate("Other Book")];
        let deduped = dedupe_candidates(results);
        assert_eq!(deduped.len(), 2);
    }
}
