// Broadcast Store (spec §4.4) — persistent record of every approved/sent/
// scheduled broadcast plus the pending-queue table. Grounded on
// engine/sessions/tasks.rs's CRUD shape and engine/sessions/memories.rs's
// FTS5 keyword-search pattern (search here mirrors the latter closely:
// best-effort sync into an FTS mirror table, MATCH query ordered by rank).

use super::BroadcastDb;
use crate::error::{EngineError, EngineResult};
use crate::types::{BroadcastRecord, BroadcastStatus, Format, QueueItem, QueueStatus};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::path::PathBuf;

fn row_to_broadcast(row: &rusqlite::Row<'_>) -> rusqlite::Result<BroadcastRecord> {
    let format: Option<String> = row.get(5)?;
    let tags_json: String = row.get(11)?;
    let links_json: String = row.get(12)?;
    let paths_json: String = row.get(13)?;
    let status: String = row.get(14)?;
    Ok(BroadcastRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        title_normalized: row.get(2)?,
        price_main: row.get(3)?,
        price_secondary: row.get(4)?,
        format: format.and_then(|f| Format::parse(&f)),
        eta: row.get(6)?,
        close_date: row.get(7)?,
        supplier_type: row.get(8)?,
        description_source: row.get(9)?,
        description_generated: row.get(10)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        preview_links: serde_json::from_str(&links_json).unwrap_or_default(),
        media_paths: serde_json::from_str::<Vec<String>>(&paths_json)
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        status: BroadcastStatus::parse(&status).unwrap_or(BroadcastStatus::Draft),
        created_at: row.get(15)?,
        sent_at: row.get(16)?,
    })
}

const BROADCAST_COLUMNS: &str = "id, title, title_normalized, price_main, price_secondary, format,
     eta, close_date, supplier_type, description_source, description_generated,
     tags, preview_links, media_paths, status, created_at, sent_at";

fn normalize_title(title: &str) -> String {
    title.to_lowercase()
}

impl BroadcastDb {
    /// Persist a new broadcast and return its id. Does not touch the
    /// underlying media files — only their paths.
    pub fn save_broadcast(&self, record: &BroadcastRecord) -> EngineResult<i64> {
        let tags_json = serde_json::to_string(&record.tags)?;
        let links_json = serde_json::to_string(&record.preview_links)?;
        let paths: Vec<String> = record.media_paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let paths_json = serde_json::to_string(&paths)?;
        let title_normalized = normalize_title(&record.title);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO broadcasts (title, title_normalized, price_main, price_secondary, format,
                eta, close_date, supplier_type, description_source, description_generated,
                tags, preview_links, media_paths, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.title,
                title_normalized,
                record.price_main,
                record.price_secondary,
                record.format.map(|f| f.as_str()),
                record.eta,
                record.close_date,
                record.supplier_type,
                record.description_source,
                record.description_generated,
                tags_json,
                links_json,
                paths_json,
                record.status.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "INSERT OR REPLACE INTO broadcasts_search (id, title, description) VALUES (?1, ?2, ?3)",
            params![id, record.title, format!("{} {}", record.description_source, record.description_generated)],
        )
        .ok();

        Ok(id)
    }

    pub fn update_status(&self, id: i64, new_status: BroadcastStatus) -> EngineResult<()> {
        let conn = self.conn.lock();
        if new_status == BroadcastStatus::Sent {
            conn.execute(
                "UPDATE broadcasts SET status = ?1, sent_at = datetime('now') WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        } else {
            conn.execute("UPDATE broadcasts SET status = ?1 WHERE id = ?2", params![new_status.as_str(), id])?;
        }
        Ok(())
    }

    pub fn get_broadcast(&self, id: i64) -> EngineResult<Option<BroadcastRecord>> {
        let conn = self.conn.lock();
        let rec = conn
            .query_row(
                &format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1"),
                params![id],
                row_to_broadcast,
            )
            .ok();
        Ok(rec)
    }

    /// Enqueue a broadcast for deferred delivery. Pre-conditions: the
    /// broadcast exists and has no other non-terminal queue item (spec §3.7).
    pub fn enqueue(&self, broadcast_id: i64, scheduled_time: DateTime<Utc>) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row("SELECT COUNT(*) FROM broadcasts WHERE id = ?1", params![broadcast_id], |r| r.get(0))?;
        if exists == 0 {
            return Err(EngineError::Other(format!("broadcast {broadcast_id} does not exist")));
        }
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE broadcast_id = ?1 AND status = 'pending'",
            params![broadcast_id],
            |r| r.get(0),
        )?;
        if pending > 0 {
            return Err(EngineError::Other(format!(
                "broadcast {broadcast_id} already has a non-terminal queue item"
            )));
        }
        conn.execute(
            "INSERT INTO queue (broadcast_id, scheduled_time, status) VALUES (?1, ?2, 'pending')",
            params![broadcast_id, scheduled_time.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn row_to_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
        let scheduled_time: String = row.get(2)?;
        let status: String = row.get(3)?;
        Ok(QueueItem {
            id: row.get(0)?,
            broadcast_id: row.get(1)?,
            scheduled_time: scheduled_time.parse().unwrap_or_else(|_| Utc::now()),
            status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending),
            retry_count: row.get(4)?,
            error_message: row.get(5)?,
        })
    }

    /// Earliest pending item whose scheduled_time <= now, ties broken by id
    /// ascending (spec §4.4).
    pub fn next_due(&self) -> EngineResult<Option<(QueueItem, BroadcastRecord)>> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let item: Option<QueueItem> = conn
            .query_row(
                "SELECT id, broadcast_id, scheduled_time, status, retry_count, error_message
                 FROM queue WHERE status = 'pending' AND scheduled_time <= ?1
                 ORDER BY scheduled_time ASC, id ASC LIMIT 1",
                params![now],
                Self::row_to_queue_item,
            )
            .ok();
        let Some(item) = item else { return Ok(None) };
        let record = conn
            .query_row(
                &format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1"),
                params![item.broadcast_id],
                row_to_broadcast,
            )
            .ok();
        Ok(record.map(|r| (item, r)))
    }

    pub fn mark_sent(&self, queue_id: i64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE queue SET status = 'sent' WHERE id = ?1", params![queue_id])?;
        Ok(())
    }

    /// Record a failed delivery attempt. Per spec §7 the item stays
    /// `pending` with an incremented retry count — it is never
    /// auto-terminalized; only `mark_sent` retires a queue row.
    pub fn mark_failed(&self, queue_id: i64, message: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE queue SET retry_count = retry_count + 1, error_message = ?2 WHERE id = ?1",
            params![queue_id, message],
        )?;
        Ok(())
    }

    pub fn list_pending(&self) -> EngineResult<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, broadcast_id, scheduled_time, status, retry_count, error_message
             FROM queue WHERE status = 'pending' ORDER BY scheduled_time ASC",
        )?;
        let items = stmt
            .query_map([], Self::row_to_queue_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    /// Atomically drain every pending row, returning what was removed
    /// (spec §4.4 `clear_pending`).
    pub fn clear_pending(&self) -> EngineResult<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let items: Vec<QueueItem> = {
            let mut stmt = conn.prepare(
                "SELECT id, broadcast_id, scheduled_time, status, retry_count, error_message
                 FROM queue WHERE status = 'pending' ORDER BY scheduled_time ASC",
            )?;
            stmt.query_map([], Self::row_to_queue_item)?.filter_map(|r| r.ok()).collect()
        };
        conn.execute("DELETE FROM queue WHERE status = 'pending'", [])?;
        Ok(items)
    }

    pub fn recent(&self, limit: u32) -> EngineResult<Vec<BroadcastRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let recs = stmt.query_map(params![limit], row_to_broadcast)?.filter_map(|r| r.ok()).collect();
        Ok(recs)
    }

    /// Full-text match on title and descriptions, case-insensitive,
    /// prefix-wildcarded at token boundaries; at most 10 results (spec §4.4).
    pub fn search(&self, query: &str) -> EngineResult<Vec<BroadcastRecord>> {
        let fts_query = query
            .split_whitespace()
            .map(|tok| format!("{}*", tok.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT b.id, b.title, b.title_normalized, b.price_main, b.price_secondary, b.format,
                    b.eta, b.close_date, b.supplier_type, b.description_source, b.description_generated,
                    b.tags, b.preview_links, b.media_paths, b.status, b.created_at, b.sent_at
             FROM broadcasts_search s
             JOIN broadcasts b ON b.id = s.id
             WHERE broadcasts_search MATCH ?1
             ORDER BY rank LIMIT 10",
        )?;
        let recs = stmt.query_map(params![fts_query], row_to_broadcast)?.filter_map(|r| r.ok()).collect();
        Ok(recs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BroadcastStatus;

    fn sample(title: &str) -> BroadcastRecord {
        BroadcastRecord {
            id: 0,
            title: title.into(),
            title_normalized: title.to_lowercase(),
            price_main: 115_000,
            price_secondary: None,
            format: Some(Format::Hb),
            eta: Some("Apr '26".into()),
            close_date: None,
            supplier_type: Some("fgb".into()),
            description_source: "raw upstream text".into(),
            description_generated: format!("Draft about {title}"),
            tags: vec!["tag1".into()],
            preview_links: vec![],
            media_paths: vec![PathBuf::from("/tmp/does-not-matter.jpg")],
            status: BroadcastStatus::Draft,
            created_at: String::new(),
            sent_at: None,
        }
    }

    #[test]
    fn save_and_get_round_trips() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let id = db.save_broadcast(&sample("Brown Bear Museum")).unwrap();
        let rec = db.get_broadcast(id).unwrap().unwrap();
        assert_eq!(rec.title, "Brown Bear Museum");
        assert_eq!(rec.price_main, 115_000);
        assert_eq!(rec.format, Some(Format::Hb));
    }

    #[test]
    fn enqueue_rejects_second_pending_item() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let id = db.save_broadcast(&sample("Only Once")).unwrap();
        db.enqueue(id, Utc::now()).unwrap();
        assert!(db.enqueue(id, Utc::now()).is_err());
    }

    #[test]
    fn next_due_orders_by_time_then_id_and_never_repeats() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let id1 = db.save_broadcast(&sample("First")).unwrap();
        let id2 = db.save_broadcast(&sample("Second")).unwrap();
        let past = Utc::now() - chrono::Duration::minutes(5);
        db.enqueue(id2, past).unwrap();
        db.enqueue(id1, past).unwrap();

        let (item, rec) = db.next_due().unwrap().unwrap();
        assert_eq!(rec.title, "Second", "id2 was enqueued first at the same timestamp bucket — tie broken by id");
        db.mark_sent(item.id).unwrap();

        let (item2, _) = db.next_due().unwrap().unwrap();
        assert_ne!(item2.id, item.id, "enqueue -> mark_sent -> next_due must never return the same id twice");
    }

    #[test]
    fn search_matches_whole_token_case_insensitive() {
        let db = BroadcastDb::open_in_memory().unwrap();
        db.save_broadcast(&sample("Brown Bear Museum")).unwrap();
        let hits = db.search("bear").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Brown Bear Museum");
    }

    #[test]
    fn clear_pending_drains_atomically() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let id = db.save_broadcast(&sample("Drain Me")).unwrap();
        db.enqueue(id, Utc::now()).unwrap();
        let drained = db.clear_pending().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(db.list_pending().unwrap().is_empty());
    }
}
