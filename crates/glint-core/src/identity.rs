//! Identity records and the identity table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FaceDescriptor, RegionKind};

const IDENTITY_PREFIX: &str = "child_";

/// One distinct physical face.
///
/// `prototype` is captured at creation and never re-averaged, so a later
/// match is always judged against the same reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub prototype: FaceDescriptor,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: u32,
    /// Region label of the observation that created this identity.
    #[serde(default)]
    pub first_region_kind: RegionKind,
}

/// All known identities plus the monotonic id counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityTable {
    #[serde(default = "first_id")]
    pub next_id: u64,
    #[serde(default)]
    pub identities: BTreeMap<String, Identity>,
}

fn first_id() -> u64 {
    1
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self {
            next_id: first_id(),
            identities: BTreeMap::new(),
        }
    }
}

impl IdentityTable {
    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.get(id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Create a new identity with a fresh id and return it.
    pub fn create(
        &mut self,
        prototype: FaceDescriptor,
        kind: RegionKind,
        now: DateTime<Utc>,
    ) -> &Identity {
        let id = format_identity_id(self.next_id);
        self.next_id += 1;

        self.identities.entry(id.clone()).or_insert(Identity {
            id,
            prototype,
            first_seen: now,
            last_seen: now,
            seen_count: 1,
            first_region_kind: kind,
        })
    }

    /// Record a successful match. Returns `false` for an unknown id.
    pub fn touch(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.identities.get_mut(id) {
            Some(identity) => {
                identity.seen_count = identity.seen_count.saturating_add(1);
                identity.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drop every identity. The counter is kept so ids are never reused.
    pub fn clear(&mut self) {
        self.identities.clear();
    }

    /// Advance the counter past `id` if it carries a numeric suffix.
    pub fn reserve_past(&mut self, id: &str) {
        if let Some(n) = identity_number(id) {
            if n >= self.next_id {
                self.next_id = n + 1;
            }
        }
    }
}

pub fn format_identity_id(n: u64) -> String {
    format!("{IDENTITY_PREFIX}{n:04}")
}

/// Numeric part of an allocated id (`child_0042` → 42).
pub fn identity_number(id: &str) -> Option<u64> {
    id.strip_prefix(IDENTITY_PREFIX)?.parse().ok()
}
