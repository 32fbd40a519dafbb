//! Entity and deletion-marker encoding for remote records.
//!
//! # Invariants
//! - Entity records use the bare entity UUID as `record_id`.
//! - Deletion markers use `marker-<kind>-<uuid>` so they never collide with
//!   entity records, and declare kind and id in their fields.

use crate::model::entity::{Entity, EntityKind};
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::remote::RemoteRecord;
use crate::sync::tombstone::Tombstone;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DELETION_MARKER_TYPE: &str = "DeletionMarker";

/// A remote record after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Entity(Entity),
    Marker(Tombstone),
    /// Record type this build does not know; skipped.
    Unknown(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerFields {
    kind: EntityKind,
    entity_id: Uuid,
    deleted_at: i64,
}

pub fn record_type_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "Task",
        EntityKind::Category => "Category",
        EntityKind::Reward => "Reward",
        EntityKind::PointsHistory => "PointsHistory",
        EntityKind::TrackingSession => "TrackingSession",
        EntityKind::JournalEntry => "JournalEntry",
        EntityKind::JournalAttachment => "JournalAttachment",
    }
}

pub fn kind_for_record_type(record_type: &str) -> Option<EntityKind> {
    EntityKind::ALL
        .into_iter()
        .find(|kind| record_type_for(*kind) == record_type)
}

pub fn marker_record_id(kind: EntityKind, id: Uuid) -> String {
    format!("marker-{}-{id}", kind.as_str())
}

pub fn encode_entity(entity: &Entity, change_tag: Option<String>) -> SyncResult<RemoteRecord> {
    let record_id = entity.id().to_string();
    let fields = match entity {
        Entity::Task(task) => serde_json::to_value(task),
        Entity::Category(category) => serde_json::to_value(category),
        Entity::Reward(reward) => serde_json::to_value(reward),
        Entity::PointsHistory(entry) => serde_json::to_value(entry),
        Entity::TrackingSession(session) => serde_json::to_value(session),
        Entity::JournalEntry(entry) => serde_json::to_value(entry),
        Entity::JournalAttachment(attachment) => serde_json::to_value(attachment),
    }
    .map_err(|err| SyncError::Decode {
        record_id: record_id.clone(),
        message: err.to_string(),
    })?;

    Ok(RemoteRecord {
        record_id,
        record_type: record_type_for(entity.kind()).to_string(),
        change_tag,
        modified_at: entity.last_modified(),
        fields,
    })
}

pub fn encode_marker(tombstone: &Tombstone) -> SyncResult<RemoteRecord> {
    let record_id = marker_record_id(tombstone.kind, tombstone.entity_id);
    let fields = serde_json::to_value(MarkerFields {
        kind: tombstone.kind,
        entity_id: tombstone.entity_id,
        deleted_at: tombstone.deleted_at,
    })
    .map_err(|err| SyncError::Decode {
        record_id: record_id.clone(),
        message: err.to_string(),
    })?;

    Ok(RemoteRecord {
        record_id,
        record_type: DELETION_MARKER_TYPE.to_string(),
        change_tag: None,
        modified_at: tombstone.deleted_at,
        fields,
    })
}

pub fn decode_record(record: &RemoteRecord) -> SyncResult<DecodedRecord> {
    if record.record_type == DELETION_MARKER_TYPE {
        let fields: MarkerFields = from_fields(record, record.fields.clone())?;
        return Ok(DecodedRecord::Marker(Tombstone {
            kind: fields.kind,
            entity_id: fields.entity_id,
            deleted_at: fields.deleted_at,
        }));
    }

    let Some(kind) = kind_for_record_type(&record.record_type) else {
        return Ok(DecodedRecord::Unknown(record.record_type.clone()));
    };
    let fields = record.fields.clone();
    let entity = match kind {
        EntityKind::Task => Entity::Task(from_fields(record, fields)?),
        EntityKind::Category => Entity::Category(from_fields(record, fields)?),
        EntityKind::Reward => Entity::Reward(from_fields(record, fields)?),
        EntityKind::PointsHistory => Entity::PointsHistory(from_fields(record, fields)?),
        EntityKind::TrackingSession => Entity::TrackingSession(from_fields(record, fields)?),
        EntityKind::JournalEntry => Entity::JournalEntry(from_fields(record, fields)?),
        EntityKind::JournalAttachment => Entity::JournalAttachment(from_fields(record, fields)?),
    };

    if entity.id().to_string() != record.record_id {
        return Err(SyncError::Decode {
            record_id: record.record_id.clone(),
            message: format!("payload id {} does not match record id", entity.id()),
        });
    }
    Ok(DecodedRecord::Entity(entity))
}

/// Decodes a record that must hold an entity (conflict re-fetch path).
pub fn decode_entity(record: &RemoteRecord) -> SyncResult<Option<Entity>> {
    match decode_record(record)? {
        DecodedRecord::Entity(entity) => Ok(Some(entity)),
        DecodedRecord::Marker(_) | DecodedRecord::Unknown(_) => Ok(None),
    }
}

fn from_fields<T: serde::de::DeserializeOwned>(record: &RemoteRecord, fields: Value) -> SyncResult<T> {
    serde_json::from_value(fields).map_err(|err| SyncError::Decode {
        record_id: record.record_id.clone(),
        message: err.to_string(),
    })
}
