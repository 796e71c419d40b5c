//! Collections: the unit of synchronization.
//!
//! A collection is an ordered list of JSON entity records stored and synced
//! as one whole value. The store does not enforce id uniqueness; callers must
//! not insert two entities with the same id.

use crate::{error::Result, CollectionKey, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PERFORMANCES: &str = "performances";
pub const MEMBERS: &str = "members";
pub const CONTRACTS: &str = "contracts";
pub const FINANCES: &str = "finances";
pub const INVENTORY: &str = "inventory";
pub const TASKS: &str = "tasks";
pub const SCORES: &str = "scores";
pub const INSTRUMENTS: &str = "instruments";

/// Every synchronized collection key, in sync order.
pub const KNOWN_COLLECTIONS: [&str; 8] = [
    PERFORMANCES,
    MEMBERS,
    CONTRACTS,
    FINANCES,
    INVENTORY,
    TASKS,
    SCORES,
    INSTRUMENTS,
];

/// Whether `key` names one of the synchronized collections.
pub fn is_known(key: &str) -> bool {
    KNOWN_COLLECTIONS.contains(&key)
}

/// An ordered sequence of entity records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(Vec<Value>);

impl Collection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wrap a list of entities.
    pub fn from_entities(entities: Vec<Value>) -> Self {
        Self(entities)
    }

    /// Interpret an arbitrary JSON value as the contents of collection `key`.
    pub fn from_value(key: &str, value: Value) -> Result<Self> {
        match value {
            Value::Array(entities) => Ok(Self(entities)),
            other => Err(Error::NotACollection {
                key: key.to_string(),
                got: json_type_name(&other).to_string(),
            }),
        }
    }

    pub fn entities(&self) -> &[Value] {
        &self.0
    }

    pub fn entities_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }

    pub fn into_entities(self) -> Vec<Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Array(self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    /// Append an entity, keeping insertion order.
    pub fn push(&mut self, entity: Value) {
        self.0.push(entity);
    }

    /// Find the first entity whose `id` field equals `id`.
    pub fn find(&self, id: &str) -> Option<&Value> {
        self.0.iter().find(|e| entity_id(e, "id") == Some(id))
    }

    /// Ids of all entities that carry a string `id`, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.0.iter().filter_map(|e| entity_id(e, "id")).collect()
    }
}

impl From<Vec<Value>> for Collection {
    fn from(entities: Vec<Value>) -> Self {
        Self(entities)
    }
}

impl FromIterator<Value> for Collection {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Read a string identifier field from an entity.
///
/// Numeric ids are not accepted: every entity in the ensemble data set uses
/// string ids.
pub fn entity_id<'a>(entity: &'a Value, field: &str) -> Option<&'a str> {
    entity
        .get(field)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Name of a JSON value's type, for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reject keys that are not part of the synchronized set.
pub fn ensure_known(key: &str) -> Result<()> {
    if is_known(key) {
        Ok(())
    } else {
        Err(Error::UnknownCollection(CollectionKey::from(key)))
    }
}
