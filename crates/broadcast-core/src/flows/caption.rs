// Caption flow (spec §4.5.4): auto-started on an unaccompanied image —
// awaiting_details → awaiting_level → awaiting_draft_action, same draft
// action vocabulary as every other flow.

use super::{FlowContext, FlowOutcome, Reply, SideEffect};
use crate::error::EngineResult;
use crate::flow_state::{CaptionState, CaptionStep};
use crate::parser::{self, ParsedCommand};
use crate::types::{CaptionAnalysis, Draft, MediaHandle, ParsedItem};
use crate::vocabulary::{self, DraftAction};
use chrono::Utc;

const DETAILS_PROMPT: &str = "Send the price, format, ETA (e.g. \"115000 hb apr 26\").";
const LEVEL_PROMPT: &str = "Pick a copywriting level:\n1. Informative\n2. Persuasive\n3. Urgent (Top Pick)";

/// The Router hands this flow the first unaccompanied image already
/// downloaded into the Media Cache; analysis happens immediately since
/// there is nothing else to collect first (spec §4.5.4).
pub async fn start(ctx: &FlowContext<'_>, media: Vec<MediaHandle>) -> EngineResult<FlowOutcome<CaptionState>> {
    let now = Utc::now();
    let mut state = CaptionState {
        step: CaptionStep::AwaitingImage,
        history: Vec::new(),
        created_at: now,
        analysis: None,
        details: None,
        level: None,
        parsed: None,
        draft: None,
        po_prefix: false,
        media,
        image_candidates: Vec::new(),
    };

    let Some(handle) = state.media.first().cloned() else {
        return Ok(FlowOutcome::terminate(vec![Reply::text("No image attached.")]));
    };
    let Some(path) = ctx.media.path_of(&handle) else {
        return Ok(FlowOutcome::terminate(vec![Reply::text("Lost track of that image — please resend it.")]));
    };
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(_) => return Ok(FlowOutcome::terminate(vec![Reply::text("Couldn't read that image — please resend it.")])),
    };
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("image.jpg").to_string();

    match ctx.ai.caption_analyze(bytes, &file_name).await {
        Ok(analysis) => {
            let summary = summarize_analysis(&analysis);
            state.analysis = Some(analysis);
            state.step = CaptionStep::AwaitingDetails;
            Ok(FlowOutcome::reply_only(vec![Reply::text(format!("{summary}\n\n{DETAILS_PROMPT}"))], state))
        }
        Err(e) => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text(e.friendly_ai_message())]))
        }
    }
}

fn summarize_analysis(analysis: &CaptionAnalysis) -> String {
    let titles = if analysis.book_titles.is_empty() { "unknown title".to_string() } else { analysis.book_titles.join(", ") };
    let series = match (&analysis.is_series, &analysis.series_name) {
        (true, Some(name)) => format!(" (series: {name})"),
        (true, None) => " (part of a series)".to_string(),
        _ => String::new(),
    };
    let publisher = analysis.publisher.as_deref().unwrap_or("unknown publisher");
    format!("{titles}{series} — {publisher}\n{}", analysis.description)
}

pub async fn handle(
    ctx: &FlowContext<'_>,
    state: CaptionState,
    raw: &str,
) -> EngineResult<FlowOutcome<CaptionState>> {
    match state.step {
        CaptionStep::AwaitingImage => Ok(FlowOutcome::reply_only(vec![Reply::text("Still analyzing — send the catalog image again if this persists.")], state)),
        CaptionStep::AwaitingDetails => handle_details(state, raw),
        CaptionStep::AwaitingLevel => handle_level(ctx, state, raw).await,
        CaptionStep::AwaitingDraftAction => handle_draft_action(ctx, state, raw).await,
        CaptionStep::AwaitingEditedText => handle_edited_text(state, raw),
    }
}

fn handle_details(mut state: CaptionState, raw: &str) -> EngineResult<FlowOutcome<CaptionState>> {
    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => Ok(FlowOutcome::terminate_and_release(state.media.clone())),
        _ => match super::parse_details(raw) {
            Ok(details) => {
                state.details = Some(details);
                state.step = CaptionStep::AwaitingLevel;
                Ok(FlowOutcome::reply_only(vec![Reply::text(LEVEL_PROMPT)], state))
            }
            Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.to_string())], state)),
        },
    }
}

async fn handle_level(
    ctx: &FlowContext<'_>,
    mut state: CaptionState,
    raw: &str,
) -> EngineResult<FlowOutcome<CaptionState>> {
    match parser::parse(raw) {
        Ok(ParsedCommand::Cancel) => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]))
        }
        Ok(ParsedCommand::Back) => {
            state.step = CaptionStep::AwaitingDetails;
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
    mut state: CaptionState,
    user_edit: Option<&str>,
) -> EngineResult<FlowOutcome<CaptionState>> {
    let analysis = state.analysis.clone().expect("draft generation requires completed analysis");
    let details = state.details.clone().unwrap_or_default();
    let level = state.level.expect("draft generation requires a chosen level");
    let preview_links: Vec<String> = state.draft.as_ref().map(|d| d.preview_links.clone()).unwrap_or_default();

    match ctx
        .ai
        .caption_generate(
            &analysis,
            details.price_main,
            details.format,
            details.eta.as_deref(),
            details.close_date.as_deref(),
            level,
            &preview_links,
        )
        .await
    {
        Ok(mut body) => {
            if let Some(hint) = user_edit {
                body = format!("{body}\n\n{hint}");
            }
            let title = analysis.book_titles.first().cloned().unwrap_or_else(|| "Untitled".to_string());
            let parsed = ParsedItem {
                title: title.clone(),
                title_clean: title.to_lowercase(),
                publisher: analysis.publisher.clone(),
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
                description_source: analysis.description.clone(),
                tags: Vec::new(),
                preview_links: preview_links.clone(),
                separator_mark: None,
                media_refs: state.media.clone(),
                ai_fallback: false,
            };
            state.parsed = Some(parsed);
            let draft = Draft { body, level, preview_links, cover: state.media.first().cloned() };
            state.draft = Some(draft.clone());
            state.step = CaptionStep::AwaitingDraftAction;
            let image = state.media.first().and_then(|h| ctx.media.path_of(h));
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
    mut state: CaptionState,
    raw: &str,
) -> EngineResult<FlowOutcome<CaptionState>> {
    if !state.image_candidates.is_empty() {
        if let Ok(ParsedCommand::Numeric(set)) = parser::parse(raw) {
            return Ok(handle_cover_pick(state, &set));
        }
    }

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
            state.step = CaptionStep::AwaitingEditedText;
            Ok(FlowOutcome::reply_only(vec![Reply::text("Send the replacement draft text.")], state))
        }
        DraftAction::Cancel => {
            ctx.media.release_all(&state.media);
            Ok(FlowOutcome::terminate(vec![Reply::text("Cancelled.")]))
        }
        DraftAction::Back => {
            state.step = CaptionStep::AwaitingLevel;
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

fn handle_cover_pick(mut state: CaptionState, set: &[u64]) -> FlowOutcome<CaptionState> {
    if set.len() == 1 && set[0] == 0 {
        state.image_candidates.clear();
        return FlowOutcome::reply_only(vec![Reply::text(super::draft_action_menu())], state);
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

async fn handle_cover_search(ctx: &FlowContext<'_>, mut state: CaptionState) -> EngineResult<FlowOutcome<CaptionState>> {
    let title = state.analysis.as_ref().and_then(|a| a.book_titles.first().cloned()).unwrap_or_default();
    match ctx.ai.search_images(&title, 5).await {
        Ok(images) => {
            let listing = images.iter().enumerate().map(|(i, img)| format!("{}. {}", i + 1, img.url)).collect::<Vec<_>>().join("\n");
            state.image_candidates = images;
            Ok(FlowOutcome::reply_only(vec![Reply::text(format!("Pick a cover (0 to keep current):\n{listing}"))], state))
        }
        Err(e) => Ok(FlowOutcome::reply_only(vec![Reply::text(e.friendly_ai_message())], state)),
    }
}

async fn handle_links(ctx: &FlowContext<'_>, mut state: CaptionState) -> EngineResult<FlowOutcome<CaptionState>> {
    let title = state.analysis.as_ref().and_then(|a| a.book_titles.first().cloned()).unwrap_or_default();
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

fn handle_edited_text(mut state: CaptionState, raw: &str) -> EngineResult<FlowOutcome<CaptionState>> {
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
        effect: SideEffect::SendNow { target: crate::types::ChatTarget::Production, parsed, draft, media },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_handles_missing_fields() {
        let analysis = CaptionAnalysis {
            is_series: false,
            series_name: None,
            publisher: None,
            book_titles: Vec::new(),
            description: "a nice book".into(),
        };
        let summary = summarize_analysis(&analysis);
        assert!(summary.contains("unknown title"));
        assert!(summary.contains("unknown publisher"));
        assert!(summary.contains("a nice book"));
    }

    #[test]
    fn summarize_includes_series_name() {
        let analysis = CaptionAnalysis {
            is_series: true,
            series_name: Some("Chronicles".into()),
            publisher: Some("Pub House".into()),
            book_titles: vec!["Book One".into()],
            description: "desc".into(),
        };
        let summary = summarize_analysis(&analysis);
        assert!(summary.contains("series: Chronicles"));
        assert!(summary.contains("Pub House"));
    }
}
