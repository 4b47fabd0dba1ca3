//! Input specs for arclet (Plan / HandleSpec / ParticleSpec).
//!
//! A Plan is produced by planning (external to this crate) and is immutable
//! once handed to the allocator. Entity payloads are kept flexible as
//! `serde_json::Value` so schemas can evolve without breaking changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::ArcId;
use crate::storage::key::StorageKey;

/// A Plan is the unit of allocation: which handles exist, which particles
/// run, and how they are wired together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub handles: Vec<HandleSpec>,
    pub particles: Vec<ParticleSpec>,

    /// A plan may carry a pre-assigned arc id (e.g. when re-submitting);
    /// otherwise the allocator mints one.
    #[serde(default)]
    pub arc_id: Option<ArcId>,
}

impl Plan {
    pub fn new(handles: Vec<HandleSpec>, particles: Vec<ParticleSpec>) -> Self {
        Self {
            handles,
            particles,
            arc_id: None,
        }
    }

    pub fn handle(&self, name: &str) -> Option<&HandleSpec> {
        self.handles.iter().find(|h| h.name == name)
    }
}

/// A shared store declared by a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSpec {
    pub name: String,

    /// `create://…` keys are unresolved; the allocator replaces them before
    /// any partition is dispatched.
    pub storage_key: StorageKey,

    pub type_tag: TypeTag,

    /// Free-form tags; `volatile` influences key synthesis for create-fated
    /// handles.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub ttl: Option<Ttl>,
}

impl HandleSpec {
    pub fn is_tagged(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A particle to instantiate, plus the handle connections it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleSpec {
    /// Name unique within the plan (also the key in persisted state).
    pub particle_name: String,

    /// Fully-qualified implementation identifier; hosts match their
    /// registered particle table against this.
    pub location: String,

    /// Connection name → spec. BTreeMap keeps serialization order stable.
    #[serde(default)]
    pub connections: BTreeMap<String, HandleConnectionSpec>,
}

/// One particle-side connection to a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleConnectionSpec {
    /// Name of the [`HandleSpec`] this connection binds to.
    pub handle_name: String,

    pub mode: HandleMode,

    pub type_tag: TypeTag,

    /// Resolved by the allocator from the handle spec; carried here so a
    /// partition is self-contained.
    pub storage_key: StorageKey,

    #[serde(default)]
    pub ttl: Option<Ttl>,
}

/// The slice of a plan assigned to one host. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPartition {
    pub arc_id: ArcId,
    pub target_host: String,
    pub particles: Vec<ParticleSpec>,
}

/// Access mode of a handle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleMode {
    Read,
    Write,
    ReadWrite,
}

impl HandleMode {
    pub fn can_read(self) -> bool {
        matches!(self, HandleMode::Read | HandleMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, HandleMode::Write | HandleMode::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandleMode::Read => "read-only",
            HandleMode::Write => "write-only",
            HandleMode::ReadWrite => "read-write",
        }
    }
}

/// Container shape of a store. Two handles on one storage key must agree
/// on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    Singleton,
    Collection,
}

impl ContainerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerType::Singleton => "singleton",
            ContainerType::Collection => "collection",
        }
    }
}

/// What the stored values are: full entities, or references to entities
/// living in another store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Entity,
    Reference,
}

/// Container shape + data type of a handle. Schema details stay in the
/// entity payloads themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeTag {
    pub container: ContainerType,
    pub data: DataType,
}

impl TypeTag {
    pub fn singleton_of(data: DataType) -> Self {
        Self {
            container: ContainerType::Singleton,
            data,
        }
    }

    pub fn collection_of(data: DataType) -> Self {
        Self {
            container: ContainerType::Collection,
            data,
        }
    }
}

/// Time-to-live for entities written through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl {
    pub minutes: i64,
}

impl Ttl {
    pub fn minutes(minutes: i64) -> Self {
        Self { minutes }
    }

    /// Absolute expiry for an entity written at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(self.minutes)
    }
}

/// The unit of storage: an id plus a flat field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: String,

    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,

    /// Milliseconds since epoch; stamped from the handle's TTL on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<i64>,
}

impl RawEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            expiration_ms: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}
