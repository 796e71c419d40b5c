//! # Ensemble Engine
//!
//! The deterministic core of the ensemble manager's sync layer.
//!
//! Every named collection (performances, members, contracts, ...) is kept as
//! a whole-collection snapshot on each device and mirrored to one remote
//! document per owner. This crate holds the logic that decides what those
//! snapshots should contain; it never touches files, sockets or clocks.
//!
//! ## Design Principles
//!
//! - **No IO**: callers pass in wall time, snapshots and records
//! - **Deterministic**: same inputs always produce same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Collections and snapshots
//!
//! A [`Collection`] is an ordered list of JSON entities. Locally it is stored
//! as a [`LocalSnapshot`] (`data` + `lastModified`); remotely as a
//! [`SyncRecord`] (`data` + server `timestamp` + writing `deviceId` + `ownerId`).
//!
//! ### Last-write-wins
//!
//! [`reconcile::resolve`] compares a snapshot with a record: the strictly
//! greater timestamp wins, ties keep the local copy. The [`LogicalClock`]
//! guarantees a device never issues a timestamp below one it has seen.
//!
//! ### Referential repair
//!
//! The [`ConsistencyEnforcer`] holds a declarative table of
//! [`CrossReferenceRule`]s and heals drifted pointers between related
//! collections in one idempotent pass.
//!
//! ## Quick Start
//!
//! ```rust
//! use ensemble_engine::{Collection, ConsistencyEnforcer, INVENTORY, MEMBERS};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! let mut collections = BTreeMap::new();
//! collections.insert(
//!     MEMBERS.to_string(),
//!     Collection::from_value(MEMBERS, json!([{"id": "m1", "assignedInventory": []}])).unwrap(),
//! );
//! collections.insert(
//!     INVENTORY.to_string(),
//!     Collection::from_value(
//!         INVENTORY,
//!         json!([{"id": "i1", "status": "assigned", "assignedTo": "m1"}]),
//!     )
//!     .unwrap(),
//! );
//!
//! let outcome = ConsistencyEnforcer::ensemble().enforce(&mut collections, &[INVENTORY]);
//! assert!(outcome.changed.contains(MEMBERS));
//! assert_eq!(
//!     collections[MEMBERS].entities()[0]["assignedInventory"],
//!     json!(["i1"])
//! );
//! ```

pub mod clock;
pub mod collection;
pub mod consistency;
pub mod error;
pub mod phase;
pub mod reconcile;
pub mod record;
pub mod session;
pub mod snapshot;
pub mod wire;

// Re-export main types at crate root
pub use clock::LogicalClock;
pub use collection::{
    Collection, CONTRACTS, FINANCES, INSTRUMENTS, INVENTORY, KNOWN_COLLECTIONS, MEMBERS,
    PERFORMANCES, SCORES, TASKS,
};
pub use consistency::{
    Cardinality, ConsistencyEnforcer, CrossReferenceRule, EnforcementOutcome,
    EnforcementReport, FieldPatch, Repair, RuleScope,
};
pub use error::Error;
pub use phase::{Divergence, SyncPhase};
pub use reconcile::{ConflictResolution, Resolution};
pub use record::SyncRecord;
pub use session::{DeviceId, Session};
pub use snapshot::{LocalSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type CollectionKey = String;
pub type EntityId = String;
pub type UserId = String;
/// Milliseconds since the Unix epoch, or a server-assigned value on the same scale.
pub type Timestamp = u64;
