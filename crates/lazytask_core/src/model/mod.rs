//! Synchronized domain model.
//!
//! # Responsibility
//! - Define canonical entity shapes shared by local store, remote records and
//!   merge logic.
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId`.
//! - Deletion is represented by tombstones in the engine ledger, never by a
//!   flag on the entity itself.

pub mod entity;
