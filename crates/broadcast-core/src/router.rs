// Router (spec §4.7) — the single entry point inbound events pass through.
// Authorizes the sender, dispatches slash commands, fans a live message out
// to whichever flow currently owns the operator's conversation, falls back
// to the forward detector / caption auto-start, and finally executes
// whatever `SideEffect` a flow step returns. Grounded on the teacher's
// `engine/channels/mod.rs` `run_channel_agent` entry point: one shared
// dispatch function fed by per-channel event sources, serialized per
// conversation by a small lock map rather than a single global mutex.

use crate::ai_client::AiClient;
use crate::config::{EngineConfig, GroupRegistry};
use crate::db::BroadcastDb;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::flow_state::{BulkStep, FlowKind, FlowState, ForwardStep};
use crate::flows::{self, FlowContext, Reply};
use crate::media::{MediaCache, MediaOwner};
use crate::transport::{InboundEvent, Transport};
use crate::types::{BroadcastRecord, BroadcastStatus, ChatTarget, Draft, Level, MediaHandle, ParsedItem};
use chrono::Utc;
use log::{error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

const HELP_TEXT: &str = "Commands:\n\
/help - show this message\n\
/status - show active flow and queue size\n\
/groups - list known chat groups\n\
/setgroup <prod|dev> <chat-id> - rebind a chat target\n\
/setmarkup <integer> - set the AI processor's price markup\n\
/getmarkup - show the current price markup\n\
/cancel - cancel the active flow\n\
/bulk [1|2|3] - start bulk collection at a copywriting level\n\
/done - finish bulk collection\n\
/new <query> - start a research search\n\
/queue - show pending and in-flight sends\n\
/flush - send everything queued right now\n\
/history [N] - show the last N broadcasts\n\
/search <keyword> - full-text search past broadcasts\n\
/supplier <fgb|littlerazy> - answer a pending supplier prompt\n\
Forward a catalog message with an image, or send a bare image, to start a draft.";

/// Every Flow-owner kind string the Media Cache ever sees, used when
/// transferring a handle's ownership from a live flow to a persisted
/// broadcast without needing to thread the originating kind through
/// `SideEffect` (spec §4.2 ownership transfer).
const FLOW_KINDS: [&str; 4] = ["forward", "bulk", "research", "caption"];

fn is_greeting(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "halo" | "hallo" | "hello" | "hi" | "hai" | "hey"
    )
}

fn is_known_slash(command: &str) -> bool {
    matches!(
        command,
        "help"
            | "status"
            | "groups"
            | "setgroup"
            | "setmarkup"
            | "getmarkup"
            | "cancel"
            | "bulk"
            | "done"
            | "new"
            | "queue"
            | "flush"
            | "history"
            | "search"
            | "supplier"
    )
}

/// Everything an inbound message needs to be routed and settled. Built once
/// at startup and shared (as `Arc<Router>`) by the transport's event loop —
/// each inbound event is handed to `handle_event` on its own spawned task
/// (spec §5 "message worker — parallel tasks").
pub struct Router {
    db: Arc<BroadcastDb>,
    media: Arc<MediaCache>,
    ai: Arc<AiClient>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<EngineConfig>,
    groups: Arc<GroupRegistry>,
    /// One lock per operator, created lazily. Held for the full duration of
    /// one inbound message's processing: this serializes a single
    /// operator's own messages (so flow-state reads/writes can never race
    /// each other) while leaving every other operator's messages free to
    /// run fully in parallel — the concurrency spec §5 actually asks for.
    operator_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<BroadcastDb>,
        media: Arc<MediaCache>,
        ai: Arc<AiClient>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<EngineConfig>,
        groups: Arc<GroupRegistry>,
    ) -> Arc<Self> {
        Arc::new(Router {
            db,
            media,
            ai,
            transport,
            dispatcher,
            config,
            groups,
            operator_locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Text { sender_id, text, .. } => self.handle_text(sender_id, text).await,
            InboundEvent::Media { sender_id, caption, media_url, .. } => {
                self.handle_media(sender_id, caption, media_url).await
            }
        }
    }

    async fn handle_text(&self, sender_id: String, text: String) {
        if !self.config.is_operator(&sender_id) {
            return;
        }
        self.route_message(&sender_id, &text, Vec::new()).await;
    }

    async fn handle_media(&self, sender_id: String, caption: Option<String>, media_url: String) {
        if !self.config.is_operator(&sender_id) {
            return;
        }
        let bytes = match self.transport.download_media(&media_url).await {
            Ok(b) => b,
            Err(e) => {
                warn!("[router] media download failed for {sender_id}: {e}");
                self.reply(&sender_id, vec![Reply::text(e.friendly_ai_message())]).await;
                return;
            }
        };
        let ext = extension_of(&media_url);
        let handle = match self.media.acquire(&bytes, ext) {
            Ok((handle, _)) => handle,
            Err(e) => {
                error!("[router] media acquire failed for {sender_id}: {e}");
                return;
            }
        };
        self.route_message(&sender_id, &caption.unwrap_or_default(), vec![handle]).await;
    }

    fn operator_lock(&self, operator: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.operator_locks.lock();
        locks.entry(operator.to_string()).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
    }

    async fn route_message(&self, operator: &str, raw: &str, media: Vec<MediaHandle>) {
        let trimmed = raw.trim();

        if let Some(rest) = trimmed.strip_prefix('/') {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let command = parts.next().unwrap_or("").to_lowercase();
            let argument = parts.next().unwrap_or("").trim().to_string();
            if is_known_slash(&command) {
                let lock = self.operator_lock(operator);
                let _guard = lock.lock().await;
                self.dispatch_slash(operator, &command, &argument).await;
                return;
            }
            // Unknown slash word: spec §4.7 rule 2 says it falls through —
            // the raw text (slash included) is routed exactly like any
            // other message below.
        }

        let lock = self.operator_lock(operator);
        let _guard = lock.lock().await;
        if let Err(e) = self.route_live_or_start(operator, trimmed, media).await {
            error!("[router] routing message from {operator} failed: {e}");
            self.reply(operator, vec![Reply::text(e.friendly_ai_message())]).await;
        }
    }

    /// Spec §4.7 rules 3-6: live flow fan-in in priority order Bulk →
    /// Research → Caption → Forward, then the forward detector, then
    /// unaccompanied-image caption auto-start, then a greeting reply, then
    /// silent drop.
    async fn route_live_or_start(&self, operator: &str, raw: &str, media: Vec<MediaHandle>) -> EngineResult<()> {
        if let Some(FlowState::Bulk(state)) = self.db.get_flow_state(operator, FlowKind::Bulk)? {
            return self.continue_bulk(operator, state, raw, media).await;
        }
        if let Some(FlowState::Research(state)) = self.db.get_flow_state(operator, FlowKind::Research)? {
            return self.continue_research(operator, state, raw).await;
        }
        if let Some(FlowState::Caption(state)) = self.db.get_flow_state(operator, FlowKind::Caption)? {
            return self.continue_caption(operator, state, raw).await;
        }
        if let Some(FlowState::Forward(state)) = self.db.get_flow_state(operator, FlowKind::Forward)? {
            return self.continue_forward(operator, state, raw).await;
        }

        if flows::is_forward(raw, media.len()) {
            return self.start_forward(operator, raw.to_string(), media).await;
        }
        if media.len() == 1 && raw.trim().is_empty() {
            return self.start_caption(operator, media).await;
        }
        if media.is_empty() && is_greeting(raw) {
            self.reply(operator, vec![Reply::text(HELP_TEXT)]).await;
        }
        Ok(())
    }

    async fn continue_bulk(
        &self,
        operator: &str,
        state: crate::flow_state::BulkState,
        raw: &str,
        media: Vec<MediaHandle>,
    ) -> EngineResult<()> {
        if flows::bulk::is_expired(&state) {
            let all_media: Vec<MediaHandle> = state.items.iter().flat_map(|i| i.media.clone()).collect();
            self.media.release_all(&all_media);
            self.db.clear_flow_state(operator, FlowKind::Bulk)?;
            self.reply(operator, vec![Reply::text("Bulk collection timed out and was cancelled.")]).await;
            return Ok(());
        }

        if matches!(state.step, BulkStep::Collecting) {
            for handle in &media {
                self.media.attach(handle, MediaOwner::Flow { operator: operator.to_string(), kind: "bulk" });
            }
            let outcome = flows::bulk::add_item(state, raw.to_string(), media);
            return self.settle(operator, FlowKind::Bulk, FlowState::Bulk, outcome).await;
        }

        let outcome = flows::bulk::handle(state, raw)?;
        self.settle(operator, FlowKind::Bulk, FlowState::Bulk, outcome).await
    }

    async fn continue_research(&self, operator: &str, state: crate::flow_state::ResearchState, raw: &str) -> EngineResult<()> {
        let outcome = flows::research::handle(&self.flow_ctx(), state, raw).await?;
        self.settle(operator, FlowKind::Research, FlowState::Research, outcome).await
    }

    async fn continue_caption(&self, operator: &str, state: crate::flow_state::CaptionState, raw: &str) -> EngineResult<()> {
        let outcome = flows::caption::handle(&self.flow_ctx(), state, raw).await?;
        self.settle(operator, FlowKind::Caption, FlowState::Caption, outcome).await
    }

    async fn continue_forward(&self, operator: &str, state: crate::flow_state::ForwardState, raw: &str) -> EngineResult<()> {
        let outcome = flows::forward::handle(&self.flow_ctx(), state, raw).await?;
        self.settle(operator, FlowKind::Forward, FlowState::Forward, outcome).await
    }

    async fn start_forward(&self, operator: &str, raw: String, media: Vec<MediaHandle>) -> EngineResult<()> {
        for handle in &media {
            self.media.attach(handle, MediaOwner::Flow { operator: operator.to_string(), kind: "forward" });
        }
        let outcome = flows::forward::start(raw, media);
        self.settle(operator, FlowKind::Forward, FlowState::Forward, outcome).await
    }

    async fn start_caption(&self, operator: &str, media: Vec<MediaHandle>) -> EngineResult<()> {
        for handle in &media {
            self.media.attach(handle, MediaOwner::Flow { operator: operator.to_string(), kind: "caption" });
        }
        let outcome = flows::caption::start(&self.flow_ctx(), media).await?;
        self.settle(operator, FlowKind::Caption, FlowState::Caption, outcome).await
    }

    // ── Slash command dispatch (spec §6.3) ─────────────────────────────

    async fn dispatch_slash(&self, operator: &str, command: &str, argument: &str) {
        let result = match command {
            "help" => {
                self.reply(operator, vec![Reply::text(HELP_TEXT)]).await;
                Ok(())
            }
            "status" => self.cmd_status(operator).await,
            "groups" => self.cmd_groups(operator).await,
            "setgroup" => self.cmd_setgroup(operator, argument).await,
            "setmarkup" => self.cmd_setmarkup(operator, argument).await,
            "getmarkup" => self.cmd_getmarkup(operator).await,
            "cancel" => self.cmd_cancel(operator).await,
            "bulk" => self.cmd_bulk(operator, argument).await,
            "done" => self.cmd_done(operator).await,
            "new" => self.cmd_new(operator, argument).await,
            "queue" => self.cmd_queue(operator).await,
            "flush" => self.cmd_flush(operator).await,
            "history" => self.cmd_history(operator, argument).await,
            "search" => self.cmd_search(operator, argument).await,
            "supplier" => self.cmd_supplier(operator, argument).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("[router] /{command} from {operator} failed: {e}");
            self.reply(operator, vec![Reply::text(e.friendly_ai_message())]).await;
        }
    }

    async fn cmd_status(&self, operator: &str) -> EngineResult<()> {
        let mut lines = vec!["Status:".to_string()];
        let mut any_flow = false;
        for kind in [FlowKind::Bulk, FlowKind::Research, FlowKind::Caption, FlowKind::Forward] {
            if self.db.get_flow_state(operator, kind)?.is_some() {
                lines.push(format!("- active flow: {}", kind.as_str()));
                any_flow = true;
            }
        }
        if !any_flow {
            lines.push("- no active flow".into());
        }
        lines.push(format!("- {} item(s) pending in the queue", self.db.list_pending()?.len()));
        self.reply(operator, vec![Reply::text(lines.join("\n"))]).await;
        Ok(())
    }

    async fn cmd_groups(&self, operator: &str) -> EngineResult<()> {
        let groups = self.transport.list_groups().await?;
        if groups.is_empty() {
            self.reply(operator, vec![Reply::text("No groups found.")]).await;
            return Ok(());
        }
        let listing = groups.iter().map(|g| format!("{} — {}", g.id, g.name)).collect::<Vec<_>>().join("\n");
        self.reply(operator, vec![Reply::text(listing)]).await;
        Ok(())
    }

    async fn cmd_setgroup(&self, operator: &str, argument: &str) -> EngineResult<()> {
        let mut parts = argument.splitn(2, char::is_whitespace);
        let which = parts.next().unwrap_or("").to_lowercase();
        let chat_id = parts.next().unwrap_or("").trim();
        let target = match which.as_str() {
            "prod" | "production" => ChatTarget::Production,
            "dev" => ChatTarget::Dev,
            _ => {
                self.reply(operator, vec![Reply::text("Usage: /setgroup <prod|dev> <chat-id>")]).await;
                return Ok(());
            }
        };
        if chat_id.is_empty() {
            self.reply(operator, vec![Reply::text("Usage: /setgroup <prod|dev> <chat-id>")]).await;
            return Ok(());
        }
        self.groups.set(target, chat_id.to_string());
        self.reply(operator, vec![Reply::text(format!("{which} chat set to {chat_id}"))]).await;
        Ok(())
    }

    async fn cmd_setmarkup(&self, operator: &str, argument: &str) -> EngineResult<()> {
        match argument.trim().parse::<i64>() {
            Ok(n) => {
                self.ai.set_markup(n).await?;
                self.reply(operator, vec![Reply::text(format!("Markup set to {n}"))]).await;
            }
            Err(_) => {
                self.reply(operator, vec![Reply::text("Usage: /setmarkup <integer>")]).await;
            }
        }
        Ok(())
    }

    async fn cmd_getmarkup(&self, operator: &str) -> EngineResult<()> {
        let markup = self.ai.get_markup().await?;
        self.reply(operator, vec![Reply::text(format!("Current markup: {markup}"))]).await;
        Ok(())
    }

    /// Cancels the first live flow in priority order Bulk → Research →
    /// Caption → Forward, releasing whatever media it was holding (spec
    /// §5 cancellation semantics).
    async fn cmd_cancel(&self, operator: &str) -> EngineResult<()> {
        for kind in [FlowKind::Bulk, FlowKind::Research, FlowKind::Caption, FlowKind::Forward] {
            if let Some(state) = self.db.get_flow_state(operator, kind)? {
                let media = match &state {
                    FlowState::Bulk(_) => state.bulk_media(),
                    _ => state.media().to_vec(),
                };
                self.media.release_all(&media);
                self.db.clear_flow_state(operator, kind)?;
                self.reply(operator, vec![Reply::text("Cancelled.")]).await;
                return Ok(());
            }
        }
        self.reply(operator, vec![Reply::text("Nothing to cancel.")]).await;
        Ok(())
    }

    async fn cmd_bulk(&self, operator: &str, argument: &str) -> EngineResult<()> {
        if self.db.get_flow_state(operator, FlowKind::Bulk)?.is_some() {
            self.reply(operator, vec![Reply::text("Bulk collection already in progress.")]).await;
            return Ok(());
        }
        let level = argument.trim().parse::<u8>().ok().and_then(Level::from_u8);
        let outcome = flows::bulk::start(level);
        self.settle(operator, FlowKind::Bulk, FlowState::Bulk, outcome).await
    }

    async fn cmd_done(&self, operator: &str) -> EngineResult<()> {
        match self.db.get_flow_state(operator, FlowKind::Bulk)? {
            Some(FlowState::Bulk(state)) if matches!(state.step, BulkStep::Collecting) => {
                let outcome = flows::bulk::finish_collecting(&self.flow_ctx(), state).await?;
                self.settle(operator, FlowKind::Bulk, FlowState::Bulk, outcome).await
            }
            _ => {
                self.reply(operator, vec![Reply::text("No bulk collection in progress.")]).await;
                Ok(())
            }
        }
    }

    async fn cmd_new(&self, operator: &str, argument: &str) -> EngineResult<()> {
        if argument.trim().is_empty() {
            self.reply(operator, vec![Reply::text("Usage: /new <query>")]).await;
            return Ok(());
        }
        let outcome = flows::research::start(&self.flow_ctx(), argument.trim().to_string()).await?;
        self.settle(operator, FlowKind::Research, FlowState::Research, outcome).await
    }

    async fn cmd_queue(&self, operator: &str) -> EngineResult<()> {
        let rows = self.dispatcher.queue_listing()?;
        if rows.is_empty() {
            self.reply(operator, vec![Reply::text("Queue is empty.")]).await;
            return Ok(());
        }
        let listing = rows
            .iter()
            .map(|r| format!("{} — {:?} — {}", r.fire_at.to_rfc3339(), r.target, r.title))
            .collect::<Vec<_>>()
            .join("\n");
        self.reply(operator, vec![Reply::text(listing)]).await;
        Ok(())
    }

    async fn cmd_flush(&self, operator: &str) -> EngineResult<()> {
        let count = self.dispatcher.flush()?;
        self.reply(operator, vec![Reply::text(format!("Flushing {count} item(s)."))]).await;
        Ok(())
    }

    async fn cmd_history(&self, operator: &str, argument: &str) -> EngineResult<()> {
        let n: u32 = argument.trim().parse().unwrap_or(10);
        let records = self.db.recent(n)?;
        if records.is_empty() {
            self.reply(operator, vec![Reply::text("No broadcasts yet.")]).await;
            return Ok(());
        }
        let listing = records
            .iter()
            .map(|r| format!("#{} [{}] {}", r.id, r.status.as_str(), r.title))
            .collect::<Vec<_>>()
            .join("\n");
        self.reply(operator, vec![Reply::text(listing)]).await;
        Ok(())
    }

    async fn cmd_search(&self, operator: &str, argument: &str) -> EngineResult<()> {
        if argument.trim().is_empty() {
            self.reply(operator, vec![Reply::text("Usage: /search <keyword>")]).await;
            return Ok(());
        }
        let records = self.db.search(argument.trim())?;
        if records.is_empty() {
            self.reply(operator, vec![Reply::text("No matches.")]).await;
            return Ok(());
        }
        let listing = records.iter().map(|r| format!("#{} {}", r.id, r.title)).collect::<Vec<_>>().join("\n");
        self.reply(operator, vec![Reply::text(listing)]).await;
        Ok(())
    }

    /// Re-routes `argument` into a waiting Forward flow's supplier-choice
    /// step, rather than the generic slot (spec §6.3 `/supplier`).
    async fn cmd_supplier(&self, operator: &str, argument: &str) -> EngineResult<()> {
        match self.db.get_flow_state(operator, FlowKind::Forward)? {
            Some(FlowState::Forward(state)) if matches!(state.step, ForwardStep::AwaitingSupplierChoice) => {
                let outcome = flows::forward::handle(&self.flow_ctx(), state, argument).await?;
                self.settle(operator, FlowKind::Forward, FlowState::Forward, outcome).await
            }
            _ => {
                self.reply(operator, vec![Reply::text("No forward flow is waiting on a supplier choice.")]).await;
                Ok(())
            }
        }
    }

    // ── Settling a flow step's outcome ─────────────────────────────────

    fn flow_ctx(&self) -> FlowContext<'_> {
        FlowContext { ai: &self.ai, media: &self.media, db: &self.db, config: &self.config }
    }

    fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.state_ttl_minutes)
    }

    async fn reply(&self, operator: &str, replies: Vec<Reply>) {
        for r in replies {
            let result = match r.image {
                Some(path) => match tokio::fs::read(&path).await {
                    Ok(bytes) => self.transport.send_image(operator, bytes, Some(&r.text)).await,
                    Err(e) => Err(EngineError::Io(e)),
                },
                None => self.transport.send_text(operator, &r.text).await,
            };
            if let Err(e) = result {
                warn!("[router] reply delivery to {operator} failed: {e}");
            }
        }
    }

    /// Persist or clear a flow step's next state, send its replies, swap in
    /// a picked cover image if one of the replies signals one, then execute
    /// whatever `SideEffect` it produced.
    async fn settle<S>(
        &self,
        operator: &str,
        kind: FlowKind,
        wrap: fn(S) -> FlowState,
        outcome: crate::flows::FlowOutcome<S>,
    ) -> EngineResult<()> {
        let cover_url = outcome.replies.iter().find_map(|r| r.text.strip_prefix("Using cover: ").map(str::to_string));

        self.reply(operator, outcome.replies).await;

        match outcome.next_state {
            Some(state) => self.db.put_flow_state(operator, kind, &wrap(state), self.state_ttl())?,
            None => self.db.clear_flow_state(operator, kind)?,
        }

        if let Some(url) = cover_url {
            self.finalize_cover_pick(operator, kind, &url).await;
        }

        self.execute_effect(operator, outcome.effect).await
    }

    /// Forward's and Research's cover-pick steps only record the
    /// operator's numeric choice in a reply ("Using cover: <url>") — per
    /// their doc comments, fetching that URL and re-attaching it as the
    /// flow's cover handle is the Router's job, since it's the only layer
    /// holding both the HTTP-capable download path and write access to the
    /// freshly-persisted FlowState.
    async fn finalize_cover_pick(&self, operator: &str, kind: FlowKind, url: &str) {
        let bytes = match flows::fetch_bytes(url).await {
            Ok(b) => b,
            Err(e) => {
                warn!("[router] cover fetch failed for {operator}: {e}");
                return;
            }
        };
        let ext = extension_of(url);
        let handle = match self.media.acquire(&bytes, ext) {
            Ok((handle, _)) => handle,
            Err(e) => {
                error!("[router] cover acquire failed for {operator}: {e}");
                return;
            }
        };
        self.media.attach(&handle, MediaOwner::Flow { operator: operator.to_string(), kind: kind.as_str() });

        let state = match self.db.get_flow_state(operator, kind) {
            Ok(Some(state)) => state,
            _ => return,
        };
        let updated = match state {
            FlowState::Forward(mut s) => {
                if let Some(old) = s.media.first().cloned() {
                    self.media.detach(&old, &MediaOwner::Flow { operator: operator.to_string(), kind: "forward" });
                }
                s.media = vec![handle.clone()];
                if let Some(draft) = s.draft.as_mut() {
                    draft.cover = Some(handle);
                }
                FlowState::Forward(s)
            }
            FlowState::Research(mut s) => {
                if let Some(old) = s.cover.take() {
                    self.media.detach(&old, &MediaOwner::Flow { operator: operator.to_string(), kind: "research" });
                    self.media.detach(&old, &MediaOwner::Flow { operator: String::new(), kind: "research" });
                }
                s.media.push(handle.clone());
                s.cover = Some(handle.clone());
                if let Some(draft) = s.draft.as_mut() {
                    draft.cover = Some(handle);
                }
                FlowState::Research(s)
            }
            FlowState::Caption(mut s) => {
                if let Some(old) = s.media.first().cloned() {
                    self.media.detach(&old, &MediaOwner::Flow { operator: operator.to_string(), kind: "caption" });
                }
                s.media = vec![handle.clone()];
                if let Some(draft) = s.draft.as_mut() {
                    draft.cover = Some(handle);
                }
                FlowState::Caption(s)
            }
            other @ FlowState::Bulk(_) => other,
        };
        if let Err(e) = self.db.put_flow_state(operator, kind, &updated, self.state_ttl()) {
            error!("[router] persisting cover swap for {operator} failed: {e}");
        }
    }

    /// Transfer every handle in `media` from whatever Flow owner it was
    /// attached under to the freshly-persisted broadcast. Tries every
    /// possible Flow-owner kind defensively rather than threading the
    /// originating flow kind through `SideEffect` (spec §4.2 ownership
    /// transfer; Research's cover download attaches with an empty operator
    /// — see flows/research.rs — so that variant is tried too).
    fn transfer_media_to_broadcast(&self, operator: &str, broadcast_id: i64, media: &[MediaHandle]) {
        for handle in media {
            self.media.attach(handle, MediaOwner::Broadcast(broadcast_id));
            for kind in FLOW_KINDS {
                self.media.detach(handle, &MediaOwner::Flow { operator: operator.to_string(), kind });
            }
            self.media.detach(handle, &MediaOwner::Flow { operator: String::new(), kind: "research" });
        }
    }

    fn build_record(&self, parsed: &ParsedItem, draft: &Draft, status: BroadcastStatus, media_paths: Vec<PathBuf>) -> BroadcastRecord {
        // ParsedItem carries no `supplier` field (see DESIGN.md) — every
        // persisted record's supplier_type is unset until that's added.
        BroadcastRecord {
            id: 0,
            title: parsed.title.clone(),
            title_normalized: parsed.title_clean.clone(),
            price_main: parsed.price_main,
            price_secondary: parsed.price_secondary,
            format: parsed.format,
            eta: parsed.eta.clone(),
            close_date: parsed.close_date.clone(),
            supplier_type: None,
            description_source: parsed.description_source.clone(),
            description_generated: draft.body.clone(),
            tags: parsed.tags.clone(),
            preview_links: draft.preview_links.clone(),
            media_paths,
            status,
            created_at: String::new(),
            sent_at: None,
        }
    }

    async fn execute_effect(&self, operator: &str, effect: crate::flows::SideEffect) -> EngineResult<()> {
        use crate::flows::SideEffect;
        match effect {
            SideEffect::None => Ok(()),
            SideEffect::ReleaseMedia(handles) => {
                self.media.release_all(&handles);
                Ok(())
            }
            SideEffect::SendNow { target, parsed, draft, media } => {
                let chat_id = self.groups.get(target);
                let media_paths: Vec<PathBuf> = media.iter().filter_map(|h| self.media.path_of(h)).collect();
                let record = self.build_record(&parsed, &draft, BroadcastStatus::Approved, media_paths.clone());
                let id = self.db.save_broadcast(&record)?;
                self.transfer_media_to_broadcast(operator, id, &media);

                let result = match media_paths.first() {
                    Some(path) => match tokio::fs::read(path).await {
                        Ok(bytes) => self.transport.send_image(&chat_id, bytes, Some(&draft.body)).await,
                        Err(e) => Err(EngineError::Io(e)),
                    },
                    None => self.transport.send_text(&chat_id, &draft.body).await,
                };
                match result {
                    Ok(()) => {
                        self.db.update_status(id, BroadcastStatus::Sent)?;
                        for handle in &media {
                            self.media.detach(handle, &MediaOwner::Broadcast(id));
                        }
                    }
                    Err(e) => {
                        warn!("[router] immediate send of broadcast {id} failed: {e}");
                        self.db.update_status(id, BroadcastStatus::Failed)?;
                    }
                }
                Ok(())
            }
            SideEffect::ScheduleOne { target, parsed, draft, media, minutes } => {
                if target == ChatTarget::Dev {
                    warn!("[router] dev-targeted schedule for \"{}\" will deliver to production at send time — BroadcastRecord doesn't carry a target yet", parsed.title);
                }
                let media_paths: Vec<PathBuf> = media.iter().filter_map(|h| self.media.path_of(h)).collect();
                let record = self.build_record(&parsed, &draft, BroadcastStatus::Scheduled, media_paths);
                let id = self.db.save_broadcast(&record)?;
                self.transfer_media_to_broadcast(operator, id, &media);
                self.db.enqueue(id, Utc::now() + chrono::Duration::minutes(minutes as i64))?;
                self.dispatcher.notify_enqueued();
                Ok(())
            }
            SideEffect::BulkSend { target, items } => {
                let mut fire_items = Vec::with_capacity(items.len());
                for (parsed, draft, media) in items {
                    let media_paths: Vec<PathBuf> = media.iter().filter_map(|h| self.media.path_of(h)).collect();
                    let record = self.build_record(&parsed, &draft, BroadcastStatus::Approved, media_paths);
                    let id = self.db.save_broadcast(&record)?;
                    self.transfer_media_to_broadcast(operator, id, &media);
                    fire_items.push((id, draft, media));
                }
                self.dispatcher.fire_bulk_send(target, fire_items);
                Ok(())
            }
            SideEffect::BulkSchedule { target, items, minutes } => {
                if target == ChatTarget::Dev {
                    warn!("[router] dev-targeted bulk schedule will deliver to production at send time");
                }
                let now = Utc::now();
                for (i, (parsed, draft, media)) in items.into_iter().enumerate() {
                    let media_paths: Vec<PathBuf> = media.iter().filter_map(|h| self.media.path_of(h)).collect();
                    let record = self.build_record(&parsed, &draft, BroadcastStatus::Scheduled, media_paths);
                    let id = self.db.save_broadcast(&record)?;
                    self.transfer_media_to_broadcast(operator, id, &media);
                    let fire_at = now + chrono::Duration::minutes(minutes as i64 * (i as i64 + 1));
                    self.db.enqueue(id, fire_at)?;
                }
                self.dispatcher.notify_enqueued();
                Ok(())
            }
        }
    }
}

/// Best-effort file extension from a URL's last path segment, capped and
/// sanitized so a query string or missing extension never produces a path
/// traversal or empty suffix.
fn extension_of(url: &str) -> &str {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .rsplit('.')
        .next()
        .filter(|e| e.len() <= 5 && !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("jpg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transport::GroupInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        texts_sent: AtomicUsize,
        media_bytes: Vec<u8>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport { texts_sent: AtomicUsize::new(0), media_bytes: b"fake-image-bytes".to_vec() }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&self, _chat_id: &str, _text: &str) -> EngineResult<()> {
            self.texts_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn send_image(&self, _chat_id: &str, _bytes: Vec<u8>, _caption: Option<&str>) -> EngineResult<()> {
            self.texts_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn list_groups(&self) -> EngineResult<Vec<GroupInfo>> {
            Ok(vec![GroupInfo { id: "grp-1".into(), name: "Main".into() }])
        }
        async fn download_media(&self, _media_url: &str) -> EngineResult<Vec<u8>> {
            Ok(self.media_bytes.clone())
        }
    }

    fn make_router() -> (Arc<Router>, Arc<BroadcastDb>, Arc<FakeTransport>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(BroadcastDb::open_in_memory().unwrap());
        let media = Arc::new(MediaCache::open(dir.path()).unwrap());
        let ai = Arc::new(AiClient::new("http://127.0.0.1:0"));
        let fake = Arc::new(FakeTransport::new());
        let transport: Arc<dyn Transport> = fake.clone();

        let mut config = EngineConfig::default();
        config.operator_ids = vec!["op1".into()];
        config.production_chat_id = "grp-prod".into();
        config.dev_chat_id = "grp-dev".into();
        let config = Arc::new(config);
        let groups = Arc::new(GroupRegistry::new(&config));

        let dispatcher = Dispatcher::new(db.clone(), media.clone(), transport.clone(), config.clone(), groups.clone());
        let router = Router::new(db.clone(), media, ai, transport, dispatcher, config, groups);
        (router, db, fake, dir)
    }

    #[tokio::test]
    async fn unauthorized_sender_is_dropped() {
        let (router, _db, fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Text { chat_id: "c1".into(), sender_id: "stranger".into(), text: "hello".into() })
            .await;
        assert_eq!(fake.texts_sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn greeting_gets_a_help_reply() {
        let (router, _db, fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Text { chat_id: "c1".into(), sender_id: "op1".into(), text: "hello".into() })
            .await;
        assert_eq!(fake.texts_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn help_command_replies_without_touching_state() {
        let (router, db, fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Text { chat_id: "c1".into(), sender_id: "op1".into(), text: "/help".into() })
            .await;
        assert_eq!(fake.texts_sent.load(Ordering::Relaxed), 1);
        assert!(db.get_flow_state("op1", FlowKind::Forward).unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_with_nothing_active_replies_accordingly() {
        let (router, _db, fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Text { chat_id: "c1".into(), sender_id: "op1".into(), text: "/cancel".into() })
            .await;
        assert_eq!(fake.texts_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn forward_detector_starts_a_flow_from_an_fgb_catalog_image() {
        let (router, db, _fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Media {
                chat_id: "c1".into(),
                sender_id: "op1".into(),
                caption: Some("\u{1f3f7} Rp 115.000 NETT".into()),
                media_url: "http://supplier.example/catalog.jpg".into(),
            })
            .await;
        let state = db.get_flow_state("op1", FlowKind::Forward).unwrap().unwrap();
        match state {
            FlowState::Forward(s) => assert_eq!(s.step, ForwardStep::AwaitingLevel),
            _ => panic!("expected a forward flow"),
        }
    }

    #[tokio::test]
    async fn setgroup_updates_the_registry() {
        let (router, _db, fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Text {
                chat_id: "c1".into(),
                sender_id: "op1".into(),
                text: "/setgroup dev new-dev-id".into(),
            })
            .await;
        assert_eq!(fake.texts_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unaccompanied_image_starts_caption_flow_once_analysis_is_unreachable() {
        // No live AI processor in tests — caption::start's analyze call
        // fails, which terminates the flow and releases the media rather
        // than leaving a state behind. This still exercises the Router's
        // auto-start branch and its failure-path cleanup.
        let (router, db, _fake, _dir) = make_router();
        router
            .handle_event(InboundEvent::Media {
                chat_id: "c1".into(),
                sender_id: "op1".into(),
                caption: None,
                media_url: "http://supplier.example/cover.jpg".into(),
            })
            .await;
        assert!(db.get_flow_state("op1", FlowKind::Caption).unwrap().is_none());
    }
}
