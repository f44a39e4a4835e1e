// Persistent store for the broadcast workstation. Stores conversation
// states and broadcast/queue rows in SQLite via rusqlite.
//
// Module layout:
//   schema          — migrations (conversation_states, broadcasts, queue, broadcasts_search)
//   state_store     — State Store operations (spec §4.3)
//   broadcast_store — Broadcast Store operations (spec §4.4)
//
// Grounded on engine/sessions/mod.rs's SessionStore: a single Mutex<Connection>
// guarding one SQLite file, opened once at startup with WAL enabled.

use crate::error::EngineResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

mod broadcast_store;
mod schema;
mod state_store;

pub struct BroadcastDb {
    pub(crate) conn: Mutex<Connection>,
}

impl BroadcastDb {
    /// Open (or create) the engine database and initialize tables.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        info!("[db] opening store at {:?}", path);
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(BroadcastDb { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(BroadcastDb { conn: Mutex::new(conn) })
    }
}

/// Initialise an already-open connection with the full schema. Used by
/// integration tests that build a `BroadcastDb` around a shared in-memory
/// connection (e.g. to construct from `rusqlite::Connection` directly).
pub fn schema_for_testing(conn: &Connection) {
    schema::run_migrations(conn).expect("schema_for_testing: migrations failed");
}
