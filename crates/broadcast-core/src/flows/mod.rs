// Flow Engine (spec §4.5) — four finite-state machines sharing one Draft
// Action Vocabulary, a forward detector, and a details-grammar parser.
// Grounded on the teacher's `engine/channels/mod.rs` `run_channel_agent`
// pattern: one shared entry point, per-channel specializations underneath.

pub mod bulk;
pub mod caption;
pub mod forward;
pub mod research;

use crate::ai_client::AiClient;
use crate::db::BroadcastDb;
use crate::media::MediaCache;
use crate::types::MediaHandle;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// One outbound reply from a flow step. `image` is a path into the Media
/// Cache to send the text as a caption on, when present.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub image: Option<PathBuf>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply { text: text.into(), image: None }
    }

    pub fn with_image(text: impl Into<String>, image: PathBuf) -> Self {
        Reply { text: text.into(), image: Some(image) }
    }
}

/// What the Router should do after a flow step runs, beyond emitting
/// replies: persist a broadcast, hand a burst/queue item to the Queue
/// Dispatcher, or nothing further.
#[derive(Debug, Clone)]
pub enum SideEffect {
    /// Send `draft` to `target` immediately and persist it as `sent`.
    /// `parsed` carries the fields a `BroadcastRecord` needs (price, format,
    /// tags…) that `Draft` itself doesn't keep around.
    SendNow {
        target: crate::types::ChatTarget,
        parsed: crate::types::ParsedItem,
        draft: crate::types::Draft,
        media: Vec<MediaHandle>,
    },
    /// Persist `draft` as `scheduled` and enqueue it `minutes` from now.
    ScheduleOne {
        target: crate::types::ChatTarget,
        parsed: crate::types::ParsedItem,
        draft: crate::types::Draft,
        media: Vec<MediaHandle>,
        minutes: u32,
    },
    /// Fire every item sequentially to `target` with a random 15-30s gap
    /// between sends (spec §4.5.2 bulk `send`).
    BulkSend {
        target: crate::types::ChatTarget,
        items: Vec<(crate::types::ParsedItem, crate::types::Draft, Vec<MediaHandle>)>,
    },
    /// Persist and enqueue one QueueItem per item, spaced `minutes` apart
    /// starting now (spec §4.5.2 bulk `schedule`).
    BulkSchedule {
        target: crate::types::ChatTarget,
        items: Vec<(crate::types::ParsedItem, crate::types::Draft, Vec<MediaHandle>)>,
        minutes: u32,
    },
    /// Release these media handles; the flow terminated without producing
    /// a broadcast to persist (e.g. bulk cancel).
    ReleaseMedia(Vec<MediaHandle>),
    None,
}

/// Bundles the external collaborators and stores a flow step needs. Built
/// once per inbound message by the Router and threaded through by value
/// (all fields are cheap Arc-like handles or plain references).
pub struct FlowContext<'a> {
    pub ai: &'a AiClient,
    pub media: &'a MediaCache,
    pub db: &'a BroadcastDb,
    pub config: &'a crate::config::EngineConfig,
}

/// Outcome of running one flow step.
pub struct FlowOutcome<S> {
    pub replies: Vec<Reply>,
    /// `None` means the flow has terminated (approved, cancelled, or expired).
    pub next_state: Option<S>,
    pub effect: SideEffect,
}

impl<S> FlowOutcome<S> {
    pub fn reply_only(replies: Vec<Reply>, next_state: S) -> Self {
        FlowOutcome { replies, next_state: Some(next_state), effect: SideEffect::None }
    }

    pub fn terminate(replies: Vec<Reply>) -> Self {
        FlowOutcome { replies, next_state: None, effect: SideEffect::None }
    }

    pub fn terminate_and_release(media: Vec<MediaHandle>) -> Self {
        FlowOutcome { replies: vec![Reply::text("Cancelled.")], next_state: None, effect: SideEffect::ReleaseMedia(media) }
    }
}

fn forward_regexes() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        vec![
            Regex::new(r"(?i)remainder\s*\|\s*eta").unwrap(),
            Regex::new(r"(?i)request\s*\|\s*eta").unwrap(),
            Regex::new(r"(?i)min\.?\s*\d+\s*pcs").unwrap(),
            Regex::new(r"(?i)nett\s*price").unwrap(),
            Regex::new(r"\u{1f3f7}\s*Rp").unwrap(),
        ]
    })
}

/// Separator glyphs suppliers use to delimit catalog sections (tree/fox
/// emoji clusters). Two or more occurrences count as a forward signal.
const SEPARATOR_GLYPHS: &[char] = &['\u{1f333}', '\u{1f98a}', '\u{1f332}'];

/// Spec §4.5.1: a forward detector match requires at least one pattern hit
/// *and* at least one image/video attached; text-only matches are not a
/// forward.
pub fn is_forward(text: &str, media_count: usize) -> bool {
    if media_count == 0 {
        return false;
    }
    if forward_regexes().iter().any(|re| re.is_match(text)) {
        return true;
    }
    let separator_hits = text.chars().filter(|c| SEPARATOR_GLYPHS.contains(c)).count();
    separator_hits >= 2
}

/// Errors parsing the Research/Caption "details" free-text grammar (spec §6.5).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetailsError {
    #[error("couldn't find a price in that reply — send the price first, e.g. \"115000 hb apr 26\"")]
    MissingPrice,
}

const MONTHS: &[(&str, u8)] = &[
    ("jan", 1), ("januari", 1),
    ("feb", 2), ("februari", 2),
    ("mar", 3), ("maret", 3),
    ("apr", 4), ("april", 4),
    ("may", 5), ("mei", 5),
    ("jun", 6), ("juni", 6),
    ("jul", 7), ("juli", 7),
    ("aug", 8), ("agustus", 8),
    ("sep", 9), ("september", 9),
    ("oct", 10), ("oktober", 10),
    ("nov", 11), ("november", 11),
    ("dec", 12), ("desember", 12),
];

fn month_number(token: &str) -> Option<u8> {
    let lower = token.to_lowercase();
    MONTHS.iter().find(|(name, _)| *name == lower || lower.starts_with(&name[..3.min(name.len())])).map(|(_, n)| *n)
}

fn month_name(n: u8) -> &'static str {
    const NAMES: [&str; 12] =
        ["January", "February", "March", "April", "May", "June", "July", "August", "September", "October", "November", "December"];
    NAMES[(n as usize).saturating_sub(1).min(11)]
}

/// `<price> [<format>] [<eta>] [close <day> <monthName>]` (spec §6.5).
pub fn parse_details(raw: &str) -> Result<crate::flow_state::Details, DetailsError> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let mut iter = tokens.into_iter().peekable();

    let price_tok = iter.next().ok_or(DetailsError::MissingPrice)?;
    let digits: String = price_tok.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(DetailsError::MissingPrice);
    }
    let price_main: i64 = digits.parse().map_err(|_| DetailsError::MissingPrice)?;

    let mut format = None;
    let mut eta = None;
    let mut close_date = None;

    while let Some(tok) = iter.next() {
        let lower = tok.to_lowercase();
        if lower == "close" {
            let day = iter.next();
            let month = iter.next();
            if let (Some(day), Some(month)) = (day, month) {
                if let Some(m) = month_number(month) {
                    close_date = Some(format!("{} {}", day, month_name(m)));
                }
            }
            continue;
        }
        if format.is_none() {
            if let Some(f) = crate::types::Format::parse(&lower) {
                format = Some(f);
                continue;
            }
        }
        if eta.is_none() {
            if let Some(m) = month_number(&lower) {
                let year = iter.peek().and_then(|y| y.parse::<u32>().ok());
                let rendered = match year {
                    Some(y) => {
                        iter.next();
                        format!("{} '{:02}", month_name(m), y % 100)
                    }
                    None => month_name(m).to_string(),
                };
                eta = Some(rendered);
            }
        }
    }

    Ok(crate::flow_state::Details { price_main, format, eta, close_date, min_order: None })
}

/// PO menu item phrases (spec §4.5.5); rotated by a cheap hash of the draft
/// body so repeated PO picks on similar drafts don't always pick the same one.
const PO_PHRASES: &[&str] = &["**PRE-ORDER**", "**PO ITEM**", "**PRE-ORDER ONLY**"];

pub fn draft_action_menu() -> &'static str {
    "YES to send · YES DEV for dev · SCHEDULE [mins] · REGEN · COVER · LINKS · EDIT · CANCEL · 0 to go back"
}

/// Fetch raw bytes from an arbitrary image-search or catalog URL. Separate
/// from `AiClient` because it isn't an AI Processor endpoint — it's
/// whatever host the search collaborator returned a link for.
pub async fn fetch_bytes(url: &str) -> crate::error::EngineResult<Vec<u8>> {
    let resp = reqwest::get(url).await.map_err(crate::error::EngineError::Network)?;
    if !resp.status().is_success() {
        return Err(crate::error::EngineError::transport(format!("fetching {url}: {}", resp.status())));
    }
    Ok(resp.bytes().await.map_err(crate::error::EngineError::Network)?.to_vec())
}

pub fn apply_po_prefix(body: &str) -> String {
    let idx = (body.len() % PO_PHRASES.len()).min(PO_PHRASES.len() - 1);
    format!("{}\n\n{}", PO_PHRASES[idx], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_detector_requires_media() {
        assert!(!is_forward("Remainder | ETA : Apr '26", 0));
        assert!(is_forward("Remainder | ETA : Apr '26", 1));
    }

    #[test]
    fn forward_detector_matches_price_tag() {
        assert!(is_forward("\u{1f3f7} Rp 115.000", 1));
    }

    #[test]
    fn forward_detector_separator_cluster() {
        let text = "\u{1f333}\u{1f333} catalog below";
        assert!(is_forward(text, 1));
        assert!(!is_forward("\u{1f333} one tree only", 1));
    }

    #[test]
    fn details_grammar_parses_price_format_eta_close() {
        let details = parse_details("115000 hb apr 26 close 20 dec").unwrap();
        assert_eq!(details.price_main, 115000);
        assert_eq!(details.format, Some(crate::types::Format::Hb));
        assert_eq!(details.eta.as_deref(), Some("April '26"));
        assert_eq!(details.close_date.as_deref(), Some("20 December"));
    }

    #[test]
    fn details_grammar_requires_price() {
        assert!(matches!(parse_details("hb apr"), Err(DetailsError::MissingPrice)));
    }

    #[test]
    fn details_grammar_price_only() {
        let details = parse_details("50000").unwrap();
        assert_eq!(details.price_main, 50000);
        assert_eq!(details.format, None);
    }
}
