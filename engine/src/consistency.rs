//! Cross-collection referential repair.
//!
//! Several screens mutate related collections independently, so pointers
//! that must agree (an inventory item's `assignedTo` and the member's
//! `assignedInventory`) can drift. Instead of per-screen fix-up code, every
//! such pair is declared once as a [`CrossReferenceRule`] and the
//! [`ConsistencyEnforcer`] heals all of them in one deterministic pass.
//!
//! # Rule semantics
//!
//! Side A carries a single forward pointer (`a_pointer`) naming an entity of
//! side B. Side B carries the back-reference (`b_refs`): a list of A ids
//! ([`Cardinality::Many`]) or a single A id ([`Cardinality::One`]).
//!
//! The forward pointer is authoritative:
//!
//! 1. A pointer naming a missing B entity is dangling: it is removed and the
//!    rule's `on_dangling` patches are applied to the A entity.
//! 2. A pointer naming an existing B entity makes sure B lists it back.
//!    With cardinality one, only the first claimant (collection order) keeps
//!    the slot; later claimants are healed like dangling pointers.
//! 3. Back-references that no forward pointer justifies are removed.
//!
//! A pass is idempotent: running it on its own output changes nothing.

use crate::{
    collection::{entity_id, CONTRACTS, INVENTORY, MEMBERS, PERFORMANCES},
    Collection, CollectionKey, EntityId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How many A ids a B entity may list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    One,
    Many,
}

/// A field change applied to an entity when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum FieldPatch {
    Set { field: String, value: Value },
    Remove { field: String },
}

impl FieldPatch {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FieldPatch::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn remove(field: impl Into<String>) -> Self {
        FieldPatch::Remove {
            field: field.into(),
        }
    }

    /// Apply to an entity object. Returns whether anything changed.
    fn apply(&self, entity: &mut Map<String, Value>) -> bool {
        match self {
            FieldPatch::Set { field, value } => {
                if entity.get(field) == Some(value) {
                    false
                } else {
                    entity.insert(field.clone(), value.clone());
                    true
                }
            }
            FieldPatch::Remove { field } => entity.remove(field).is_some(),
        }
    }
}

/// Where the two sides of a rule live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RuleScope {
    /// Two top-level collections.
    Across { a: CollectionKey, b: CollectionKey },
    /// Two array fields inside every entity of one collection.
    Nested {
        container: CollectionKey,
        a: String,
        b: String,
    },
}

/// One declared back-reference pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossReferenceRule {
    pub name: String,
    pub scope: RuleScope,
    /// Identifier field of A entities
    pub a_id: String,
    /// Forward pointer field on A entities
    pub a_pointer: String,
    /// Identifier field of B entities
    pub b_id: String,
    /// Back-reference field on B entities
    pub b_refs: String,
    pub cardinality: Cardinality,
    /// Patches applied to an A entity whose pointer resolves
    pub on_linked: Vec<FieldPatch>,
    /// Patches applied to an A entity whose pointer is removed or absent
    pub on_dangling: Vec<FieldPatch>,
}

impl CrossReferenceRule {
    /// A rule between two top-level collections.
    pub fn across(
        name: impl Into<String>,
        a: impl Into<CollectionKey>,
        a_pointer: impl Into<String>,
        b: impl Into<CollectionKey>,
        b_refs: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            scope: RuleScope::Across {
                a: a.into(),
                b: b.into(),
            },
            a_id: "id".into(),
            a_pointer: a_pointer.into(),
            b_id: "id".into(),
            b_refs: b_refs.into(),
            cardinality,
            on_linked: Vec::new(),
            on_dangling: Vec::new(),
        }
    }

    /// A rule between two array fields of each entity in `container`.
    pub fn nested(
        name: impl Into<String>,
        container: impl Into<CollectionKey>,
        a: impl Into<String>,
        a_pointer: impl Into<String>,
        b: impl Into<String>,
        b_refs: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            scope: RuleScope::Nested {
                container: container.into(),
                a: a.into(),
                b: b.into(),
            },
            a_id: "id".into(),
            a_pointer: a_pointer.into(),
            b_id: "id".into(),
            b_refs: b_refs.into(),
            cardinality,
            on_linked: Vec::new(),
            on_dangling: Vec::new(),
        }
    }

    pub fn with_ids(mut self, a_id: impl Into<String>, b_id: impl Into<String>) -> Self {
        self.a_id = a_id.into();
        self.b_id = b_id.into();
        self
    }

    pub fn on_linked(mut self, patch: FieldPatch) -> Self {
        self.on_linked.push(patch);
        self
    }

    pub fn on_dangling(mut self, patch: FieldPatch) -> Self {
        self.on_dangling.push(patch);
        self
    }

    /// Collection keys this rule reads and may rewrite.
    pub fn collections(&self) -> Vec<&str> {
        match &self.scope {
            RuleScope::Across { a, b } => vec![a.as_str(), b.as_str()],
            RuleScope::Nested { container, .. } => vec![container.as_str()],
        }
    }

    pub fn touches(&self, key: &str) -> bool {
        self.collections().contains(&key)
    }
}

/// A single correction made by the enforcer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "repair")]
pub enum Repair {
    /// A's pointer named a B entity that does not exist
    ClearedDangling { a: EntityId, target: EntityId },
    /// A's pointer lost the single back-reference slot to an earlier claimant
    ClearedSuperseded {
        a: EntityId,
        target: EntityId,
        holder: EntityId,
    },
    /// A's linked patches changed it (e.g. status set to "assigned")
    PatchedLinked { a: EntityId },
    /// A has no pointer but still carried linked state
    PatchedUnlinked { a: EntityId },
    AddedBackReference { b: EntityId, a: EntityId },
    RemovedBackReference { b: EntityId, a: String },
}

impl Repair {
    fn touches_a(&self) -> bool {
        matches!(
            self,
            Repair::ClearedDangling { .. }
                | Repair::ClearedSuperseded { .. }
                | Repair::PatchedLinked { .. }
                | Repair::PatchedUnlinked { .. }
        )
    }
}

/// Repairs made by one rule, optionally inside one container entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementReport {
    pub rule: String,
    /// Container entity id for nested rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<EntityId>,
    pub repairs: Vec<Repair>,
}

/// Result of one enforcer pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementOutcome {
    /// Non-empty reports only
    pub reports: Vec<EnforcementReport>,
    /// Collections whose contents were rewritten
    pub changed: BTreeSet<CollectionKey>,
    /// Rules not evaluated because a collection they span was missing
    pub skipped: Vec<String>,
}

impl EnforcementOutcome {
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn repair_count(&self) -> usize {
        self.reports.iter().map(|r| r.repairs.len()).sum()
    }
}

/// Runs every declared rule over a set of collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyEnforcer {
    rules: Vec<CrossReferenceRule>,
}

impl ConsistencyEnforcer {
    pub fn new(rules: Vec<CrossReferenceRule>) -> Self {
        Self { rules }
    }

    /// The rule table of the ensemble manager.
    pub fn ensemble() -> Self {
        Self::new(vec![
            CrossReferenceRule::across(
                "inventory-assignment",
                INVENTORY,
                "assignedTo",
                MEMBERS,
                "assignedInventory",
                Cardinality::Many,
            )
            .on_linked(FieldPatch::set("status", "assigned"))
            .on_dangling(FieldPatch::set("status", "available")),
            CrossReferenceRule::nested(
                "transport-roster",
                PERFORMANCES,
                "attendance",
                "transportAssignment",
                "transport",
                "passengers",
                Cardinality::Many,
            )
            .with_ids("memberId", "id"),
            CrossReferenceRule::across(
                "performance-contract",
                CONTRACTS,
                "performanceId",
                PERFORMANCES,
                "contractId",
                Cardinality::One,
            ),
        ])
    }

    pub fn rules(&self) -> &[CrossReferenceRule] {
        &self.rules
    }

    pub fn rules_touching<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Iterator<Item = &'a CrossReferenceRule> + 'a {
        self.rules.iter().filter(move |r| r.touches(key))
    }

    /// Every collection that must be present to enforce the rules touching
    /// any of `keys`, including `keys` themselves.
    pub fn collections_needed(&self, keys: &[&str]) -> BTreeSet<CollectionKey> {
        let mut needed: BTreeSet<CollectionKey> = keys.iter().map(|k| k.to_string()).collect();
        for rule in self.rules.iter().filter(|r| keys.iter().any(|k| r.touches(k))) {
            needed.extend(rule.collections().into_iter().map(String::from));
        }
        needed
    }

    /// Heal every rule touching one of `touched`, in table order.
    ///
    /// Rules spanning a collection absent from `collections` are skipped: an
    /// absent partner has not been hydrated yet, and treating it as empty
    /// would unassign everything.
    pub fn enforce(
        &self,
        collections: &mut BTreeMap<CollectionKey, Collection>,
        touched: &[&str],
    ) -> EnforcementOutcome {
        let mut outcome = EnforcementOutcome::default();

        for rule in self
            .rules
            .iter()
            .filter(|r| touched.iter().any(|k| r.touches(k)))
        {
            if !rule
                .collections()
                .iter()
                .all(|k| collections.contains_key(*k))
            {
                outcome.skipped.push(rule.name.clone());
                continue;
            }

            match &rule.scope {
                RuleScope::Across { a, b } if a != b => {
                    enforce_across(rule, a, b, collections, &mut outcome);
                }
                RuleScope::Across { .. } => outcome.skipped.push(rule.name.clone()),
                RuleScope::Nested {
                    container,
                    a: a_field,
                    b: b_field,
                } => {
                    enforce_nested(rule, container, a_field, b_field, collections, &mut outcome);
                }
            }
        }

        outcome
    }

    /// Heal all rules across all collections present.
    pub fn enforce_all(
        &self,
        collections: &mut BTreeMap<CollectionKey, Collection>,
    ) -> EnforcementOutcome {
        let keys: Vec<String> = collections.keys().cloned().collect();
        let touched: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.enforce(collections, &touched)
    }
}

fn enforce_across(
    rule: &CrossReferenceRule,
    a_key: &str,
    b_key: &str,
    collections: &mut BTreeMap<CollectionKey, Collection>,
    outcome: &mut EnforcementOutcome,
) {
    let (mut a, mut b) = match (collections.remove(a_key), collections.remove(b_key)) {
        (Some(a), Some(b)) => (a, b),
        (a, b) => {
            if let Some(a) = a {
                collections.insert(a_key.to_string(), a);
            }
            if let Some(b) = b {
                collections.insert(b_key.to_string(), b);
            }
            return;
        }
    };

    let repairs = heal(rule, a.entities_mut(), b.entities_mut());

    if repairs.iter().any(Repair::touches_a) {
        outcome.changed.insert(a_key.to_string());
    }
    if repairs.iter().any(|r| !r.touches_a()) {
        outcome.changed.insert(b_key.to_string());
    }
    if !repairs.is_empty() {
        outcome.reports.push(EnforcementReport {
            rule: rule.name.clone(),
            container: None,
            repairs,
        });
    }

    collections.insert(a_key.to_string(), a);
    collections.insert(b_key.to_string(), b);
}

fn enforce_nested(
    rule: &CrossReferenceRule,
    container_key: &str,
    a_field: &str,
    b_field: &str,
    collections: &mut BTreeMap<CollectionKey, Collection>,
    outcome: &mut EnforcementOutcome,
) {
    let Some(container) = collections.get_mut(container_key) else {
        return;
    };

    let mut changed = false;
    for entity in container.entities_mut() {
        let container_id = entity_id(entity, "id").map(String::from);
        let Some(object) = entity.as_object_mut() else {
            continue;
        };
        if !object.contains_key(a_field) && !object.contains_key(b_field) {
            continue;
        }

        let mut a = take_array(object, a_field);
        let mut b = take_array(object, b_field);
        let repairs = heal(
            rule,
            a.as_deref_mut().unwrap_or(&mut []),
            b.as_deref_mut().unwrap_or(&mut []),
        );
        restore_array(object, a_field, a);
        restore_array(object, b_field, b);

        if !repairs.is_empty() {
            changed = true;
            outcome.reports.push(EnforcementReport {
                rule: rule.name.clone(),
                container: container_id,
                repairs,
            });
        }
    }

    if changed {
        outcome.changed.insert(container_key.to_string());
    }
}

/// Move an array field out of an object. Missing or non-array fields read as
/// `None` and are left untouched when restored.
fn take_array(object: &mut Map<String, Value>, field: &str) -> Option<Vec<Value>> {
    match object.get_mut(field) {
        Some(Value::Array(items)) => Some(std::mem::take(items)),
        _ => None,
    }
}

fn restore_array(object: &mut Map<String, Value>, field: &str, items: Option<Vec<Value>>) {
    if let Some(items) = items {
        object.insert(field.to_string(), Value::Array(items));
    }
}

/// Single pass over one A list and one B list.
fn heal(rule: &CrossReferenceRule, a: &mut [Value], b: &mut [Value]) -> Vec<Repair> {
    let mut repairs = Vec::new();

    // First occurrence wins when ids are duplicated.
    let mut b_index: HashMap<String, usize> = HashMap::new();
    for (idx, entity) in b.iter().enumerate() {
        if let Some(id) = entity_id(entity, &rule.b_id) {
            b_index.entry(id.to_string()).or_insert(idx);
        }
    }

    let mut expected: HashMap<usize, Vec<EntityId>> = HashMap::new();

    for entity in a.iter_mut() {
        let Some(a_id) = entity_id(entity, &rule.a_id).map(String::from) else {
            continue;
        };
        let Some(target) = entity_id(entity, &rule.a_pointer).map(String::from) else {
            if let Some(object) = entity.as_object_mut() {
                let mut patched = false;
                for patch in &rule.on_dangling {
                    patched |= patch.apply(object);
                }
                if patched {
                    repairs.push(Repair::PatchedUnlinked { a: a_id });
                }
            }
            continue;
        };
        let Some(object) = entity.as_object_mut() else {
            continue;
        };

        match b_index.get(&target) {
            None => {
                clear_pointer(rule, object);
                repairs.push(Repair::ClearedDangling { a: a_id, target });
            }
            Some(&b_idx) => {
                let claimants = expected.entry(b_idx).or_default();
                if rule.cardinality == Cardinality::One && !claimants.is_empty() {
                    let holder = claimants[0].clone();
                    clear_pointer(rule, object);
                    repairs.push(Repair::ClearedSuperseded {
                        a: a_id,
                        target,
                        holder,
                    });
                    continue;
                }
                if !claimants.contains(&a_id) {
                    claimants.push(a_id.clone());
                }
                let mut patched = false;
                for patch in &rule.on_linked {
                    patched |= patch.apply(object);
                }
                if patched {
                    repairs.push(Repair::PatchedLinked { a: a_id });
                }
            }
        }
    }

    for (idx, entity) in b.iter_mut().enumerate() {
        let b_id = entity_id(entity, &rule.b_id).map(String::from);
        // Entities that lost the index to an earlier duplicate get nothing.
        let wanted: &[EntityId] = match &b_id {
            Some(id) if b_index.get(id) == Some(&idx) => {
                expected.get(&idx).map(Vec::as_slice).unwrap_or(&[])
            }
            _ => &[],
        };
        let Some(object) = entity.as_object_mut() else {
            continue;
        };
        let label = b_id.unwrap_or_default();

        match rule.cardinality {
            Cardinality::Many => sync_many(&rule.b_refs, object, wanted, &label, &mut repairs),
            Cardinality::One => sync_one(&rule.b_refs, object, wanted, &label, &mut repairs),
        }
    }

    repairs
}

fn clear_pointer(rule: &CrossReferenceRule, object: &mut Map<String, Value>) {
    object.remove(&rule.a_pointer);
    for patch in &rule.on_dangling {
        patch.apply(object);
    }
}

fn sync_many(
    field: &str,
    object: &mut Map<String, Value>,
    wanted: &[EntityId],
    label: &str,
    repairs: &mut Vec<Repair>,
) {
    let (current, scalar) = match object.get(field) {
        Some(Value::Array(items)) => (items.clone(), false),
        Some(Value::Null) | None => (Vec::new(), false),
        Some(other) => {
            repairs.push(Repair::RemovedBackReference {
                b: label.to_string(),
                a: other.as_str().map(String::from).unwrap_or_else(|| other.to_string()),
            });
            (Vec::new(), true)
        }
    };

    let mut next: Vec<Value> = Vec::with_capacity(wanted.len());
    let mut kept: BTreeSet<&str> = BTreeSet::new();
    for item in &current {
        match item.as_str() {
            Some(id) if wanted.iter().any(|w| w == id) && kept.insert(id) => {
                next.push(item.clone());
            }
            _ => repairs.push(Repair::RemovedBackReference {
                b: label.to_string(),
                a: item
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| item.to_string()),
            }),
        }
    }
    for id in wanted {
        if !kept.contains(id.as_str()) {
            next.push(Value::String(id.clone()));
            repairs.push(Repair::AddedBackReference {
                b: label.to_string(),
                a: id.clone(),
            });
        }
    }

    if scalar && next.is_empty() {
        object.remove(field);
    } else if scalar || next != current {
        object.insert(field.to_string(), Value::Array(next));
    }
}

fn sync_one(
    field: &str,
    object: &mut Map<String, Value>,
    wanted: &[EntityId],
    label: &str,
    repairs: &mut Vec<Repair>,
) {
    let current = object.get(field).and_then(Value::as_str).map(String::from);
    let wanted = wanted.first();

    if current.as_ref() == wanted {
        return;
    }

    if let Some(stale) = current {
        repairs.push(Repair::RemovedBackReference {
            b: label.to_string(),
            a: stale,
        });
    }
    match wanted {
        Some(id) => {
            object.insert(field.to_string(), Value::String(id.clone()));
            repairs.push(Repair::AddedBackReference {
                b: label.to_string(),
                a: id.clone(),
            });
        }
        None => {
            object.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collections(pairs: Vec<(&str, Value)>) -> BTreeMap<CollectionKey, Collection> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), Collection::from_value(k, v).unwrap()))
            .collect()
    }

    #[test]
    fn adds_missing_back_reference() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (MEMBERS, json!([{"id": "m1", "assignedInventory": []}])),
            (
                INVENTORY,
                json!([{"id": "i1", "status": "assigned", "assignedTo": "m1"}]),
            ),
        ]);

        let outcome = enforcer.enforce(&mut c, &[INVENTORY]);

        assert_eq!(
            c[MEMBERS].entities()[0]["assignedInventory"],
            json!(["i1"])
        );
        assert_eq!(outcome.changed, BTreeSet::from([MEMBERS.to_string()]));
        assert_eq!(
            outcome.reports[0].repairs,
            vec![Repair::AddedBackReference {
                b: "m1".into(),
                a: "i1".into()
            }]
        );
    }

    #[test]
    fn dangling_assignment_becomes_available() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (MEMBERS, json!([{"id": "m1"}])),
            (
                INVENTORY,
                json!([{"id": "i1", "status": "assigned", "assignedTo": "m2"}]),
            ),
        ]);

        enforcer.enforce(&mut c, &[INVENTORY]);

        let item = &c[INVENTORY].entities()[0];
        assert_eq!(item["status"], "available");
        assert!(item.get("assignedTo").is_none());
    }

    #[test]
    fn assigned_item_without_owner_becomes_available() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (MEMBERS, json!([{"id": "m1", "assignedInventory": ["i1"]}])),
            (INVENTORY, json!([{"id": "i1", "status": "assigned"}])),
        ]);

        let outcome = enforcer.enforce(&mut c, &[MEMBERS]);

        assert_eq!(c[MEMBERS].entities()[0]["assignedInventory"], json!([]));
        assert_eq!(c[INVENTORY].entities()[0]["status"], "available");
        assert_eq!(
            outcome.changed,
            BTreeSet::from([MEMBERS.to_string(), INVENTORY.to_string()])
        );
        assert!(outcome.reports[0]
            .repairs
            .contains(&Repair::PatchedUnlinked { a: "i1".into() }));

        let again = enforcer.enforce(&mut c, &[MEMBERS]);
        assert!(again.is_clean());
    }

    #[test]
    fn removes_unjustified_back_references() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (
                MEMBERS,
                json!([{"id": "m1", "assignedInventory": ["i1", "ghost", "i2"]}]),
            ),
            (
                INVENTORY,
                json!([
                    {"id": "i1", "status": "assigned", "assignedTo": "m1"},
                    {"id": "i2", "status": "available"}
                ]),
            ),
        ]);

        enforcer.enforce(&mut c, &[MEMBERS]);

        assert_eq!(
            c[MEMBERS].entities()[0]["assignedInventory"],
            json!(["i1"])
        );
    }

    #[test]
    fn linked_item_is_marked_assigned() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (MEMBERS, json!([{"id": "m1", "assignedInventory": ["i1"]}])),
            (
                INVENTORY,
                json!([{"id": "i1", "status": "available", "assignedTo": "m1"}]),
            ),
        ]);

        let outcome = enforcer.enforce(&mut c, &[INVENTORY]);

        assert_eq!(c[INVENTORY].entities()[0]["status"], "assigned");
        assert_eq!(outcome.changed, BTreeSet::from([INVENTORY.to_string()]));
    }

    #[test]
    fn reassignment_moves_back_reference() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (
                MEMBERS,
                json!([
                    {"id": "m1", "assignedInventory": ["i1"]},
                    {"id": "m2", "assignedInventory": []}
                ]),
            ),
            (
                INVENTORY,
                json!([{"id": "i1", "status": "assigned", "assignedTo": "m2"}]),
            ),
        ]);

        enforcer.enforce(&mut c, &[INVENTORY]);

        assert_eq!(c[MEMBERS].entities()[0]["assignedInventory"], json!([]));
        assert_eq!(
            c[MEMBERS].entities()[1]["assignedInventory"],
            json!(["i1"])
        );
    }

    #[test]
    fn does_not_add_empty_back_reference_fields() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (MEMBERS, json!([{"id": "m1", "name": "Ana"}])),
            (INVENTORY, json!([{"id": "i1", "status": "available"}])),
        ]);

        let outcome = enforcer.enforce(&mut c, &[INVENTORY]);

        assert!(outcome.is_clean());
        assert_eq!(c[MEMBERS].entities()[0], json!({"id": "m1", "name": "Ana"}));
    }

    #[test]
    fn skips_rules_with_missing_partner() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![(
            INVENTORY,
            json!([{"id": "i1", "status": "assigned", "assignedTo": "m1"}]),
        )]);

        let outcome = enforcer.enforce(&mut c, &[INVENTORY]);

        assert_eq!(outcome.skipped, vec!["inventory-assignment".to_string()]);
        assert_eq!(c[INVENTORY].entities()[0]["assignedTo"], "m1");
    }

    #[test]
    fn transport_roster_inside_performances() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![(
            PERFORMANCES,
            json!([{
                "id": "p1",
                "attendance": [
                    {"memberId": "m1", "status": "confirmed", "transportAssignment": "bus"},
                    {"memberId": "m2", "status": "confirmed", "transportAssignment": "van"},
                    {"memberId": "m3", "status": "declined"}
                ],
                "transport": [
                    {"id": "bus", "passengers": ["m3"]}
                ]
            }]),
        )]);

        let outcome = enforcer.enforce(&mut c, &[PERFORMANCES]);

        let perf = &c[PERFORMANCES].entities()[0];
        assert_eq!(perf["transport"][0]["passengers"], json!(["m1"]));
        assert!(perf["attendance"][1].get("transportAssignment").is_none());
        assert_eq!(outcome.reports[0].container.as_deref(), Some("p1"));
        assert_eq!(outcome.changed, BTreeSet::from([PERFORMANCES.to_string()]));
    }

    #[test]
    fn contract_back_reference_is_single_valued() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (
                PERFORMANCES,
                json!([{"id": "p1"}, {"id": "p2", "contractId": "c-old"}]),
            ),
            (
                CONTRACTS,
                json!([
                    {"id": "c1", "performanceId": "p1"},
                    {"id": "c2", "performanceId": "p1"},
                    {"id": "c3", "performanceId": "gone"}
                ]),
            ),
        ]);

        let outcome = enforcer.enforce(&mut c, &[CONTRACTS]);

        let perfs = c[PERFORMANCES].entities();
        assert_eq!(perfs[0]["contractId"], "c1");
        assert!(perfs[1].get("contractId").is_none());

        let contracts = c[CONTRACTS].entities();
        assert_eq!(contracts[0]["performanceId"], "p1");
        assert!(contracts[1].get("performanceId").is_none());
        assert!(contracts[2].get("performanceId").is_none());

        assert!(outcome.reports[0].repairs.contains(&Repair::ClearedSuperseded {
            a: "c2".into(),
            target: "p1".into(),
            holder: "c1".into(),
        }));
    }

    #[test]
    fn second_pass_changes_nothing() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let mut c = collections(vec![
            (
                MEMBERS,
                json!([{"id": "m1", "assignedInventory": ["x", "i2", "i2"]}, {"id": "m3"}]),
            ),
            (
                INVENTORY,
                json!([
                    {"id": "i1", "status": "assigned", "assignedTo": "m1"},
                    {"id": "i2", "status": "assigned", "assignedTo": "m1"},
                    {"id": "i3", "status": "assigned", "assignedTo": "nobody"}
                ]),
            ),
            (PERFORMANCES, json!([{"id": "p1", "contractId": "c9"}])),
            (CONTRACTS, json!([{"id": "c1", "performanceId": "p1"}])),
        ]);

        let first = enforcer.enforce_all(&mut c);
        assert!(!first.is_clean());
        let after_first = c.clone();

        let second = enforcer.enforce_all(&mut c);
        assert!(second.is_clean());
        assert_eq!(second.repair_count(), 0);
        assert_eq!(c, after_first);
    }

    #[test]
    fn collections_needed_includes_partners() {
        let enforcer = ConsistencyEnforcer::ensemble();
        let needed = enforcer.collections_needed(&[MEMBERS]);
        assert_eq!(
            needed,
            BTreeSet::from([MEMBERS.to_string(), INVENTORY.to_string()])
        );
        assert_eq!(enforcer.rules_touching(PERFORMANCES).count(), 2);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn roster(
            members: &[Vec<u8>],
            items: &[(Option<u8>, bool)],
        ) -> BTreeMap<CollectionKey, Collection> {
            let members: Vec<Value> = members
                .iter()
                .enumerate()
                .map(|(m, held)| {
                    let held: Vec<String> = held.iter().map(|i| format!("i{i}")).collect();
                    json!({"id": format!("m{m}"), "assignedInventory": held})
                })
                .collect();
            let items: Vec<Value> = items
                .iter()
                .enumerate()
                .map(|(i, (owner, marked))| match owner {
                    Some(m) => json!({"id": format!("i{i}"), "status": "assigned", "assignedTo": format!("m{m}")}),
                    None if *marked => json!({"id": format!("i{i}"), "status": "assigned"}),
                    None => json!({"id": format!("i{i}"), "status": "available"}),
                })
                .collect();
            BTreeMap::from([
                (MEMBERS.to_string(), Collection::from_entities(members)),
                (INVENTORY.to_string(), Collection::from_entities(items)),
            ])
        }

        proptest! {
            #[test]
            fn prop_one_pass_reaches_a_fixpoint(
                members in proptest::collection::vec(proptest::collection::vec(0u8..12, 0..4), 0..8),
                items in proptest::collection::vec((proptest::option::of(0u8..10), any::<bool>()), 0..12),
            ) {
                let enforcer = ConsistencyEnforcer::ensemble();
                let mut c = roster(&members, &items);

                enforcer.enforce_all(&mut c);
                let healed = c.clone();
                let second = enforcer.enforce_all(&mut c);

                prop_assert!(second.is_clean());
                prop_assert_eq!(c, healed);
            }

            #[test]
            fn prop_sides_agree_after_one_pass(
                members in proptest::collection::vec(proptest::collection::vec(0u8..12, 0..4), 1..8),
                items in proptest::collection::vec((proptest::option::of(0u8..10), any::<bool>()), 0..12),
            ) {
                let enforcer = ConsistencyEnforcer::ensemble();
                let mut c = roster(&members, &items);
                enforcer.enforce_all(&mut c);

                for item in c[INVENTORY].iter() {
                    let Some(owner) = item.get("assignedTo").and_then(Value::as_str) else {
                        prop_assert_eq!(&item["status"], &json!("available"));
                        continue;
                    };
                    let member = c[MEMBERS].find(owner);
                    prop_assert!(member.is_some());
                    let held = &member.unwrap()["assignedInventory"];
                    prop_assert!(held.as_array().unwrap().contains(&item["id"]));
                    prop_assert_eq!(&item["status"], &json!("assigned"));
                }
            }
        }
    }
}
