// FlowState (spec §3.5) — a tagged union over flow-kind variants, each a
// plain record with a required step tag and optional collected fields.
// Grounded on the teacher's design-note preference (spec §9: "never a
// dictionary of strings") and on engine/types.rs's small, explicit enums.

use crate::types::{
    BookSearchResult, CaptionAnalysis, Draft, Format, ImageCandidate, Level, MediaHandle,
    ParsedItem, Supplier,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Forward,
    Bulk,
    Research,
    Caption,
}

impl FlowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::Forward => "forward",
            FlowKind::Bulk => "bulk",
            FlowKind::Research => "research",
            FlowKind::Caption => "caption",
        }
    }
}

/// Price/format/eta/close-date parsed from the Research/Caption free-text
/// details grammar (spec §6.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Details {
    pub price_main: i64,
    pub format: Option<Format>,
    pub eta: Option<String>,
    pub close_date: Option<String>,
    pub min_order: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardStep {
    AwaitingSupplierChoice,
    AwaitingLevel,
    AwaitingDraftAction,
    AwaitingEditedText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardState {
    pub step: ForwardStep,
    pub history: Vec<ForwardStep>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub raw_text: String,
    pub supplier: Option<Supplier>,
    pub level: Option<Level>,
    pub parsed: Option<ParsedItem>,
    pub draft: Option<Draft>,
    pub missing_fields: Vec<String>,
    pub po_prefix: bool,
    pub media: Vec<MediaHandle>,
    /// Populated while awaiting a `COVER` numeric pick; empty otherwise.
    #[serde(default)]
    pub image_candidates: Vec<ImageCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkStep {
    Collecting,
    Processing,
    AwaitingBatchAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    pub raw_text: String,
    pub media: Vec<MediaHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkState {
    pub step: BulkStep,
    pub history: Vec<BulkStep>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub level: Level,
    pub items: Vec<BulkItem>,
    /// Parallel to `items`; `None` entries are failed parses (spec §4.5.2).
    pub drafts: Vec<Option<Draft>>,
    /// Parallel to `drafts` — the ParsedItem each draft was generated from,
    /// kept around so a Send/Schedule side effect can persist an accurate
    /// BroadcastRecord.
    pub parsed_items: Vec<Option<ParsedItem>>,
    pub selected_indices: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResearchStep {
    AwaitingSelection,
    AwaitingDetails,
    AwaitingLevel,
    AwaitingDraftAction,
    AwaitingImageChoice,
    AwaitingEditedText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub step: ResearchStep,
    pub history: Vec<ResearchStep>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub query: String,
    pub candidates: Vec<BookSearchResult>,
    pub selected: Option<BookSearchResult>,
    pub display_title: Option<String>,
    pub enriched_description: Option<String>,
    pub cover: Option<MediaHandle>,
    pub details: Option<Details>,
    pub level: Option<Level>,
    pub parsed: Option<ParsedItem>,
    pub draft: Option<Draft>,
    pub image_candidates: Vec<ImageCandidate>,
    pub po_prefix: bool,
    pub media: Vec<MediaHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionStep {
    AwaitingImage,
    AwaitingDetails,
    AwaitingLevel,
    AwaitingDraftAction,
    AwaitingEditedText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionState {
    pub step: CaptionStep,
    pub history: Vec<CaptionStep>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub analysis: Option<CaptionAnalysis>,
    pub details: Option<Details>,
    pub level: Option<Level>,
    pub parsed: Option<ParsedItem>,
    pub draft: Option<Draft>,
    pub po_prefix: bool,
    pub media: Vec<MediaHandle>,
    #[serde(default)]
    pub image_candidates: Vec<ImageCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowState {
    Forward(ForwardState),
    Bulk(BulkState),
    Research(ResearchState),
    Caption(CaptionState),
}

impl FlowState {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowState::Forward(_) => FlowKind::Forward,
            FlowState::Bulk(_) => FlowKind::Bulk,
            FlowState::Research(_) => FlowKind::Research,
            FlowState::Caption(_) => FlowKind::Caption,
        }
    }

    pub fn media(&self) -> &[MediaHandle] {
        match self {
            FlowState::Forward(s) => &s.media,
            FlowState::Bulk(_) => &[],
            FlowState::Research(s) => &s.media,
            FlowState::Caption(s) => &s.media,
        }
    }

    pub fn bulk_media(&self) -> Vec<MediaHandle> {
        match self {
            FlowState::Bulk(s) => s.items.iter().flat_map(|i| i.media.clone()).collect(),
            _ => Vec::new(),
        }
    }
}
