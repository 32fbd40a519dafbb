//! Sync and conflict-resolution engine.
//!
//! # Responsibility
//! - Keep the local store and one remote record zone convergent.
//! - Expose a single orchestrator entry point; everything else is wiring.
//!
//! # Layout
//! - Durable state: `tombstone`, `cursor`, `record_index`, `outbox`, `prefs`.
//! - Boundaries: `local_store`, `remote`, `clock`, `env`.
//! - Flow: `fetcher` → `apply` (using `merge`) → cursor commit; local
//!   mutations go through `pipeline`.

pub mod apply;
pub mod cancel;
pub mod clock;
pub mod cursor;
pub mod env;
pub mod error;
pub mod fetcher;
pub mod local_store;
pub mod merge;
pub mod orchestrator;
pub mod outbox;
pub mod pipeline;
pub mod prefs;
pub mod record;
pub mod record_index;
pub mod remote;
pub mod state;
pub mod tombstone;
