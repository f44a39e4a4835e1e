// State Store (spec §4.3) — persistent mapping from (operator, flow kind)
// to a serialized FlowState with an absolute expiry. Grounded on
// engine/sessions/sessions.rs's CRUD style (prepare → query_map →
// filter_map(ok) → collect) and engine/sessions/config.rs's simple
// key/value get/set shape.

use super::BroadcastDb;
use crate::error::EngineResult;
use crate::flow_state::{FlowKind, FlowState};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::params;

impl BroadcastDb {
    /// Returns the operator's state for `kind` unless it has expired.
    /// An expired row is left in place for the next `sweep_expired` call
    /// (spec §4.3 `get` semantics).
    pub fn get_flow_state(&self, operator: &str, kind: FlowKind) -> EngineResult<Option<FlowState>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT payload, expires_at FROM conversation_states WHERE operator_id = ?1 AND kind = ?2",
                params![operator, kind.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok();

        let Some((payload, expires_at)) = row else { return Ok(None) };
        let expires_at: DateTime<Utc> = expires_at.parse().map_err(|_| {
            crate::error::EngineError::Other("corrupt expires_at in conversation_states".into())
        })?;
        if expires_at <= Utc::now() {
            return Ok(None);
        }
        let state: FlowState = serde_json::from_str(&payload)?;
        Ok(Some(state))
    }

    /// Upsert the operator's state for `kind`; expiry = now + ttl.
    pub fn put_flow_state(
        &self,
        operator: &str,
        kind: FlowKind,
        state: &FlowState,
        ttl: chrono::Duration,
    ) -> EngineResult<()> {
        let payload = serde_json::to_string(state)?;
        let expires_at = (Utc::now() + ttl).to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_states (operator_id, kind, payload, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(operator_id, kind) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at,
                updated_at = datetime('now')",
            params![operator, kind.as_str(), payload, expires_at],
        )?;
        Ok(())
    }

    pub fn clear_flow_state(&self, operator: &str, kind: FlowKind) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM conversation_states WHERE operator_id = ?1 AND kind = ?2",
            params![operator, kind.as_str()],
        )?;
        Ok(())
    }

    pub fn clear_all_flow_states(&self, operator: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM conversation_states WHERE operator_id = ?1", params![operator])?;
        Ok(())
    }

    /// Delete every row with `expires_at <= now`. Called at startup and
    /// periodically (spec §4.3).
    pub fn sweep_expired_states(&self) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let n = conn.execute("DELETE FROM conversation_states WHERE expires_at <= ?1", params![now])?;
        if n > 0 {
            debug!("[state-store] swept {n} expired conversation state(s)");
        }
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_state::{ForwardState, ForwardStep};

    fn sample_forward() -> FlowState {
        FlowState::Forward(ForwardState {
            step: ForwardStep::AwaitingLevel,
            history: vec![ForwardStep::AwaitingSupplierChoice],
            created_at: Utc::now(),
            raw_text: "catalog text".into(),
            supplier: None,
            level: None,
            parsed: None,
            draft: None,
            missing_fields: Vec::new(),
            po_prefix: false,
            media: Vec::new(),
            image_candidates: Vec::new(),
        })
    }

    #[test]
    fn put_then_get_round_trips() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let state = sample_forward();
        db.put_flow_state("op1", FlowKind::Forward, &state, chrono::Duration::minutes(10)).unwrap();
        let loaded = db.get_flow_state("op1", FlowKind::Forward).unwrap().unwrap();
        assert_eq!(loaded.kind(), FlowKind::Forward);
    }

    #[test]
    fn ttl_zero_expires_immediately() {
        let db = BroadcastDb::open_in_memory().unwrap();
        let state = sample_forward();
        db.put_flow_state("op1", FlowKind::Forward, &state, chrono::Duration::minutes(0)).unwrap();
        // expires_at == now (or slightly in the past by the time get() runs)
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(db.get_flow_state("op1", FlowKind::Forward).unwrap().is_none());
    }

    #[test]
    fn at_most_one_state_per_operator_and_kind() {
        let db = BroadcastDb::open_in_memory().unwrap();
        db.put_flow_state("op1", FlowKind::Forward, &sample_forward(), chrono::Duration::minutes(10)).unwrap();
        db.put_flow_state("op1", FlowKind::Forward, &sample_forward(), chrono::Duration::minutes(10)).unwrap();
        let conn = db.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversation_states WHERE operator_id = 'op1' AND kind = 'forward'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn clear_removes_row() {
        let db = BroadcastDb::open_in_memory().unwrap();
        db.put_flow_state("op1", FlowKind::Forward, &sample_forward(), chrono::Duration::minutes(10)).unwrap();
        db.clear_flow_state("op1", FlowKind::Forward).unwrap();
        assert!(db.get_flow_state("op1", FlowKind::Forward).unwrap().is_none());
    }

    #[test]
    fn sweep_expired_deletes_stale_rows() {
        let db = BroadcastDb::open_in_memory().unwrap();
        db.put_flow_state("op1", FlowKind::Forward, &sample_forward(), chrono::Duration::minutes(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let n = db.sweep_expired_states().unwrap();
        assert_eq!(n, 1);
    }
}
