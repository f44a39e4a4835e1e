// Broadcast Engine — the promotional broadcast workstation's core.
// Conversational flow engine and broadcast scheduling/dispatch, bridging a
// messaging transport and an AI rewriting/research service.
//
// Module layout mirrors the spec's own section boundaries:
//   error      — EngineError / EngineResult, shared by every module
//   types      — plain data records crossing the store or AI boundary
//   parser     — Command Parser (spec §4.1)
//   vocabulary — Draft Action Vocabulary (spec §4.5.5)
//   media      — Media Cache (spec §4.2)
//   flow_state — FlowState persistence shape (spec §4.3)
//   db         — State Store + Broadcast Store, SQLite-backed (spec §4.3, §4.4)
//   ai_client  — AI Processor HTTP client (spec §4.5, §6.1)
//   transport  — Messaging Transport trait + HTTP implementation (spec §4.1)
//   config     — EngineConfig, GroupRegistry (spec §3, §4.6, §9)
//   flows      — the four conversational flows (spec §4.5)
//   dispatcher — Queue Dispatcher (spec §4.6)
//   router     — single inbound entry point (spec §4.7)

pub mod ai_client;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod flow_state;
pub mod flows;
pub mod media;
pub mod parser;
pub mod router;
pub mod transport;
pub mod types;
pub mod vocabulary;

pub use ai_client::AiClient;
pub use config::{EngineConfig, GroupRegistry};
pub use db::BroadcastDb;
pub use dispatcher::{Dispatcher, QueueRow};
pub use error::{EngineError, EngineResult};
pub use media::MediaCache;
pub use router::Router;
pub use transport::{HttpTransport, InboundEvent, Transport};
