// Database schema and migrations for the broadcast workstation's store.
// Called once at startup by BroadcastDb::open() after WAL is enabled.
// Grounded on engine/sessions/schema.rs: idempotent CREATE TABLE IF NOT
// EXISTS / ALTER TABLE ... ADD COLUMN blocks, appended rather than edited,
// so upgrade paths stay clean. Four tables per spec §6.4: broadcasts,
// queue, conversation_states, broadcasts_search (FTS5 mirror).

use crate::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS broadcasts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            title_normalized TEXT NOT NULL,
            price_main INTEGER NOT NULL,
            price_secondary INTEGER,
            format TEXT,
            eta TEXT,
            close_date TEXT,
            supplier_type TEXT,
            description_source TEXT NOT NULL DEFAULT '',
            description_generated TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            preview_links TEXT NOT NULL DEFAULT '[]',
            media_paths TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            sent_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_broadcasts_status ON broadcasts(status);

        CREATE TABLE IF NOT EXISTS queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id),
            scheduled_time TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_queue_status_time ON queue(status, scheduled_time);

        CREATE TABLE IF NOT EXISTS conversation_states (
            operator_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (operator_id, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_states_expiry ON conversation_states(expires_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS broadcasts_search USING fts5(
            id UNINDEXED,
            title,
            description
        );
        ",
    )?;

    // Keep the FTS mirror in sync for any broadcasts saved before the
    // virtual table existed (mirrors the memories_fts backfill pattern).
    conn.execute_batch(
        "
        INSERT OR IGNORE INTO broadcasts_search(id, title, description)
        SELECT id, title, description_source || ' ' || description_generated
        FROM broadcasts
        WHERE id NOT IN (SELECT id FROM broadcasts_search);
        ",
    )
    .ok();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA journal_mode = WAL;").unwrap();
        conn
    }

    #[test]
    fn migrations_run_cleanly() {
        let conn = in_memory_db();
        let result = run_migrations(&conn);
        assert!(result.is_ok(), "First migration run failed: {:?}", result);
    }

    #[test]
    fn migrations_idempotent() {
        let conn = in_memory_db();
        run_migrations(&conn).unwrap();
        let result = run_migrations(&conn);
        assert!(result.is_ok(), "Second migration run failed: {:?}", result);
    }
}
