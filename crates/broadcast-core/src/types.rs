// Core data types shared across the engine — ParsedItem, Draft, FlowState,
// BroadcastRecord, QueueItem, ScheduleBurst. Grounded on the teacher's
// engine/types.rs: plain records, small enums over stringly-typed fields,
// serde derive everywhere a value crosses the store or the AI boundary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The two supplier message formats the forward detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Supplier {
    Fgb,
    Littlerazy,
}

impl Supplier {
    pub fn as_tag(self) -> &'static str {
        match self {
            Supplier::Fgb => "fgb",
            Supplier::Littlerazy => "littlerazy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fgb" | "1" => Some(Supplier::Fgb),
            "littlerazy" | "2" => Some(Supplier::Littlerazy),
            _ => None,
        }
    }
}

/// Book/catalog format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Hb,
    Pb,
    Bb,
    Hc,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hb" => Some(Format::Hb),
            "pb" => Some(Format::Pb),
            "bb" => Some(Format::Bb),
            "hc" => Some(Format::Hc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Hb => "HB",
            Format::Pb => "PB",
            Format::Bb => "BB",
            Format::Hc => "HC",
        }
    }
}

/// Copywriting intensity level. Level 3 drafts must carry the Top-Pick marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Informative = 1,
    Persuasive = 2,
    Urgent = 3,
}

impl Level {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Level::Informative),
            2 => Some(Level::Persuasive),
            3 => Some(Level::Urgent),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Opaque handle into the Media Cache. Reference-counted by the cache;
/// cheap to clone and pass between a FlowState and a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHandle(pub String);

/// A supplier-independent parsed catalog entry. `title` and `price_main`
/// are required — their absence at the parser boundary is a parse error,
/// never silently defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedItem {
    pub title: String,
    pub title_clean: String,
    pub publisher: Option<String>,
    pub format: Option<Format>,
    pub price_main: i64,
    pub price_secondary: Option<i64>,
    pub currency_markup: i64,
    pub eta: Option<String>,
    pub close_date: Option<String>,
    pub min_order: Option<i64>,
    pub stock: Option<i64>,
    pub pages: Option<i64>,
    pub item_type: Option<String>,
    pub description_source: String,
    pub tags: Vec<String>,
    pub preview_links: Vec<String>,
    pub separator_mark: Option<String>,
    pub media_refs: Vec<MediaHandle>,
    pub ai_fallback: bool,
}

/// A list of fields a rule-based parse found missing. The Flow Engine asks
/// for these one at a time before requesting a Draft (spec §4.5.1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MissingFields {
    pub fields: Vec<String>,
}

/// Generated promotional text for a (ParsedItem, level) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub body: String,
    pub level: Level,
    pub preview_links: Vec<String>,
    pub cover: Option<MediaHandle>,
}

/// Lifecycle status of a persisted broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Approved,
    Scheduled,
    Sent,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastStatus::Draft => "draft",
            BroadcastStatus::Approved => "approved",
            BroadcastStatus::Scheduled => "scheduled",
            BroadcastStatus::Sent => "sent",
            BroadcastStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "approved" => Some(Self::Approved),
            "scheduled" => Some(Self::Scheduled),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted broadcast record (spec §3.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub id: i64,
    pub title: String,
    pub title_normalized: String,
    pub price_main: i64,
    pub price_secondary: Option<i64>,
    pub format: Option<Format>,
    pub eta: Option<String>,
    pub close_date: Option<String>,
    pub supplier_type: Option<String>,
    pub description_source: String,
    pub description_generated: String,
    pub tags: Vec<String>,
    pub preview_links: Vec<String>,
    pub media_paths: Vec<PathBuf>,
    pub status: BroadcastStatus,
    pub created_at: String,
    pub sent_at: Option<String>,
}

/// Queue item status (spec §3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted queue row referencing a broadcast (spec §3.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub broadcast_id: i64,
    pub scheduled_time: chrono::DateTime<chrono::Utc>,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
}

/// Named chat target (spec §3.2). The core never inspects the inner id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTarget {
    Production,
    Dev,
}

/// A single burst entry (spec §3.8): an in-memory scheduled send with its
/// own cancellation handle, owned by the Queue Dispatcher.
pub struct BurstEntry {
    pub id: u64,
    /// The already-persisted (status `approved`) record this burst will
    /// mark `sent` once it fires.
    pub broadcast_id: i64,
    pub draft: Draft,
    pub media: Vec<MediaHandle>,
    pub target: ChatTarget,
    pub fire_at: chrono::DateTime<chrono::Utc>,
    pub cancel: tokio::sync::oneshot::Sender<()>,
}

/// Result of the AI processor's vision analysis for an unaccompanied image
/// (spec §4.5.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionAnalysis {
    pub is_series: bool,
    pub series_name: Option<String>,
    pub publisher: Option<String>,
    pub book_titles: Vec<String>,
    pub description: String,
}

/// A single research candidate returned by the AI/search collaborator
/// (spec §4.5.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSearchResult {
    pub title: String,
    pub publisher: Option<String>,
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
}

/// An image candidate from the image-search collaborator (spec §6.1 COVER).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnail: Option<String>,
    pub source: Option<String>,
}
