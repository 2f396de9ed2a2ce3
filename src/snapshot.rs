//! Snapshot flattening.
//!
//! The transport reports presence per session key, each with a list of
//! payloads. Display semantics are "is this user online", so the default
//! policy collapses entries to one per `user_id`, keeping the latest
//! `last_active`. Session keys are visited in sorted order so the output is
//! stable for identical input.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::DedupPolicy;
use crate::state::PresenceState;
use crate::transport::RawPresence;

/// Flatten raw transport state into snapshot order.
#[must_use]
pub fn flatten(raw: &RawPresence, policy: DedupPolicy) -> Vec<PresenceState> {
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();
    let entries = keys.into_iter().flat_map(|key| raw[key].iter());

    match policy {
        DedupPolicy::BySession => entries.cloned().collect(),
        DedupPolicy::ByUser => dedup_by_user(entries),
    }
}

/// Keep one entry per user: the one with the greatest `last_active`.
/// Ties keep the first seen. Output order is first appearance.
#[must_use]
pub fn dedup_by_user<'a>(entries: impl IntoIterator<Item = &'a PresenceState>) -> Vec<PresenceState> {
    let mut out: Vec<PresenceState> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for entry in entries {
        match index.get(&entry.user_id) {
            Some(&slot) => {
                if entry.last_active > out[slot].last_active {
                    out[slot] = entry.clone();
                }
            }
            None => {
                index.insert(entry.user_id, out.len());
                out.push(entry.clone());
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
