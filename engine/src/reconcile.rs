//! Last-write-wins resolution between a local snapshot and a remote record.
//!
//! The timestamp is the only authority. The side with the strictly greater
//! timestamp wins; on an exact tie the local snapshot is kept so that no
//! redundant write happens.

use crate::{phase::Divergence, LocalSnapshot, SyncPhase, SyncRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local snapshot won
    LocalWins,
    /// Remote record won
    RemoteWins,
}

/// Outcome of comparing what the device has with what the remote has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum Resolution {
    /// Neither side has anything: the collection starts empty
    Empty,
    /// Timestamps are equal; nothing to do
    InSync,
    /// Keep the local snapshot
    KeepLocal {
        /// Whether a remote record existed at all
        remote_present: bool,
    },
    /// Replace local with the remote record
    AcceptRemote {
        /// A local snapshot existed and is being overwritten
        overwrites_local: bool,
    },
}

impl Resolution {
    /// The conflict winner, when both sides existed and differed.
    pub fn conflict(&self) -> Option<ConflictResolution> {
        match self {
            Resolution::KeepLocal {
                remote_present: true,
            } => Some(ConflictResolution::LocalWins),
            Resolution::AcceptRemote {
                overwrites_local: true,
            } => Some(ConflictResolution::RemoteWins),
            _ => None,
        }
    }

    /// Phase the key is in once this resolution has been applied locally.
    ///
    /// Accepting the remote brings the device in sync; keeping a strictly
    /// newer local snapshot leaves it ahead until the next push lands.
    pub fn resulting_phase(&self) -> SyncPhase {
        match self {
            Resolution::KeepLocal { .. } => SyncPhase::Diverged(Divergence::LocalAhead),
            Resolution::Empty | Resolution::InSync | Resolution::AcceptRemote { .. } => {
                SyncPhase::Synced
            }
        }
    }
}

/// Decide which side wins.
pub fn resolve(local: Option<&LocalSnapshot>, remote: Option<&SyncRecord>) -> Resolution {
    match (local, remote) {
        (None, None) => Resolution::Empty,
        (Some(_), None) => Resolution::KeepLocal {
            remote_present: false,
        },
        (None, Some(_)) => Resolution::AcceptRemote {
            overwrites_local: false,
        },
        (Some(local), Some(remote)) => {
            if remote.timestamp > local.last_modified {
                Resolution::AcceptRemote {
                    overwrites_local: true,
                }
            } else if remote.timestamp == local.last_modified {
                Resolution::InSync
            } else {
                Resolution::KeepLocal {
                    remote_present: true,
                }
            }
        }
    }
}

/// Whether a record delivered with `incoming` should be applied on top of
/// the current local snapshot.
///
/// Duplicates (same timestamp) and stale deliveries are ignored, which makes
/// applying the same record twice equivalent to applying it once and keeps
/// `last_modified` from moving backward.
pub fn should_apply(local: Option<&LocalSnapshot>, incoming: Timestamp) -> bool {
    match local {
        None => true,
        Some(snapshot) => incoming > snapshot.last_modified,
    }
}

/// Fold a sequence of remote records into a local snapshot, in arrival order.
///
/// Returns the resulting snapshot. The winner depends only on timestamps, not
/// on the order the records arrive in.
pub fn apply_all<'a>(
    mut local: Option<LocalSnapshot>,
    records: impl IntoIterator<Item = &'a SyncRecord>,
) -> Option<LocalSnapshot> {
    for record in records {
        if should_apply(local.as_ref(), record.timestamp) {
            local = Some(LocalSnapshot::new(record.data.clone(), record.timestamp));
        }
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceId;
    use serde_json::json;

    fn snapshot(name: &str, ts: Timestamp) -> LocalSnapshot {
        LocalSnapshot::new(vec![json!({"id": "m1", "name": name})].into(), ts)
    }

    fn record(name: &str, ts: Timestamp) -> SyncRecord {
        SyncRecord::new(
            "members",
            vec![json!({"id": "m1", "name": name})].into(),
            ts,
            DeviceId::new("dev-b"),
            "owner-1",
        )
    }

    #[test]
    fn nothing_anywhere_is_empty() {
        assert_eq!(resolve(None, None), Resolution::Empty);
        assert_eq!(Resolution::Empty.resulting_phase(), SyncPhase::Synced);
    }

    #[test]
    fn remote_only_is_accepted() {
        let remote = record("Ana", 5);
        let res = resolve(None, Some(&remote));
        assert_eq!(
            res,
            Resolution::AcceptRemote {
                overwrites_local: false
            }
        );
        assert_eq!(res.conflict(), None);
    }

    #[test]
    fn local_only_is_kept() {
        let local = snapshot("Ana", 5);
        let res = resolve(Some(&local), None);
        assert_eq!(
            res,
            Resolution::KeepLocal {
                remote_present: false
            }
        );
        assert_eq!(res.resulting_phase(), SyncPhase::Diverged(Divergence::LocalAhead));
    }

    #[test]
    fn newer_remote_wins() {
        let local = snapshot("Ana", 5);
        let remote = record("Bea", 9);
        let res = resolve(Some(&local), Some(&remote));
        assert_eq!(res.conflict(), Some(ConflictResolution::RemoteWins));
    }

    #[test]
    fn newer_local_wins() {
        let local = snapshot("Ana", 9);
        let remote = record("Bea", 5);
        let res = resolve(Some(&local), Some(&remote));
        assert_eq!(res.conflict(), Some(ConflictResolution::LocalWins));
    }

    #[test]
    fn tie_keeps_local_without_writing() {
        let local = snapshot("Ana", 7);
        let remote = record("Bea", 7);
        let res = resolve(Some(&local), Some(&remote));
        assert_eq!(res, Resolution::InSync);
        assert_eq!(res.conflict(), None);
    }

    #[test]
    fn duplicate_delivery_is_ignored() {
        let r = record("Ana", 7);
        let once = apply_all(None, [&r]);
        let twice = apply_all(None, [&r, &r]);
        assert_eq!(once, twice);
    }

    #[test]
    fn arrival_order_does_not_change_winner() {
        let r1 = record("old", 5);
        let r2 = record("new", 9);

        let forward = apply_all(None, [&r1, &r2]).unwrap();
        let backward = apply_all(None, [&r2, &r1]).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward.last_modified, 9);
        assert_eq!(forward.data, r2.data);
    }

    #[test]
    fn stale_record_never_moves_snapshot_backward() {
        let local = snapshot("mine", 10);
        assert!(!should_apply(Some(&local), 10));
        assert!(!should_apply(Some(&local), 3));
        assert!(should_apply(Some(&local), 11));
        assert!(should_apply(None, 0));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_winner_is_max_timestamp(
                stamps in proptest::collection::vec(1u64..10_000, 1..12),
            ) {
                let records: Vec<SyncRecord> = stamps
                    .iter()
                    .map(|ts| record(&format!("v{ts}"), *ts))
                    .collect();

                let mut reversed = records.clone();
                reversed.reverse();

                let a = apply_all(None, records.iter()).unwrap();
                let b = apply_all(None, reversed.iter()).unwrap();

                let max = *stamps.iter().max().unwrap();
                prop_assert_eq!(a.last_modified, max);
                prop_assert_eq!(&a, &b);
            }

            #[test]
            fn prop_resolve_agrees_with_should_apply(
                local_ts in 0u64..1_000,
                remote_ts in 0u64..1_000,
            ) {
                let local = snapshot("l", local_ts);
                let remote = record("r", remote_ts);
                let accepted = matches!(
                    resolve(Some(&local), Some(&remote)),
                    Resolution::AcceptRemote { .. }
                );
                prop_assert_eq!(accepted, should_apply(Some(&local), remote_ts));
            }
        }
    }
}
