//! Mapping between stable editor identities and raster instance ids.
//!
//! Raster ids are small (1..=65535) and recomputed on every build, so they
//! cannot serve as external identity. `IdentityTable` allocates them
//! bijectively and is persisted through each payload's tracking records,
//! which lets the same identity keep the same id, and with it the same
//! tracking record, across any number of save/load cycles.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::builder::MAX_INSTANCE_ID;
use crate::error::{MaskError, Result};
use crate::types::{TrackingRecord, UnifiedMaskPayload};

/// Identity given to a payload instance that has no tracking record.
pub fn synthetic_identity(image_id: &str, instance_id: u16) -> String {
    format!("{image_id}#{instance_id}")
}

/// Tracking id minted for a restored instance without a saved one.
pub fn synthetic_track_id(base: Option<&str>, image_id: &str, instance_id: u16) -> String {
    match base {
        Some(base) => format!("{base}_inst_{instance_id}"),
        None => format!("iss_{image_id}_inst_{instance_id}"),
    }
}

/// Bijective `identity <-> instance id` allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTable {
    by_identity: HashMap<String, u16>,
    by_id: BTreeMap<u16, String>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover the table a payload was saved with.
    ///
    /// Tracking records supply `originalIdentity -> id`; instances without
    /// one, or whose identity was already claimed by a lower id, are seeded
    /// under [`synthetic_identity`].
    pub fn from_payload(payload: &UnifiedMaskPayload) -> Self {
        let mut table = Self::new();
        let mut ids: Vec<u16> = payload.instances.values().map(|inst| inst.id).collect();
        ids.sort_unstable();
        for id in ids {
            let saved = payload
                .tracking_for(id)
                .map(|record| record.original_identity.as_str())
                .filter(|identity| !identity.is_empty());
            let inserted = saved.is_some_and(|identity| table.insert(identity.to_string(), id));
            if !inserted {
                table.insert(synthetic_identity(&payload.image_id, id), id);
            }
        }
        table
    }

    fn insert(&mut self, identity: String, id: u16) -> bool {
        if id == 0 || self.by_identity.contains_key(&identity) || self.by_id.contains_key(&id) {
            return false;
        }
        self.by_id.insert(id, identity.clone());
        self.by_identity.insert(identity, id);
        true
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<u16> {
        self.by_identity.get(identity).copied()
    }

    pub fn identity_of(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Id for `identity`, allocating the smallest free one if it is new.
    pub fn allocate(&mut self, identity: &str) -> Result<u16> {
        if let Some(id) = self.get(identity) {
            return Ok(id);
        }
        let id = self.smallest_free_id().ok_or(MaskError::InstanceIdExhausted)?;
        self.insert(identity.to_string(), id);
        Ok(id)
    }

    fn smallest_free_id(&self) -> Option<u16> {
        let mut candidate = 1u32;
        for &taken in self.by_id.keys() {
            if taken as u32 > candidate {
                break;
            }
            candidate = taken as u32 + 1;
        }
        (candidate <= MAX_INSTANCE_ID).then_some(candidate as u16)
    }

    /// Forget every identity not in `live`, freeing its id.
    pub fn retain(&mut self, live: &HashSet<&str>) {
        self.by_identity.retain(|identity, _| live.contains(identity.as_str()));
        self.by_id.retain(|_, identity| live.contains(identity.as_str()));
    }
}

/// Restore `(trackId, trackName)` for a payload instance.
///
/// A saved record's id and name win; without a saved id a synthetic one is
/// derived and the name (if any) is kept for the editor's auto-naming.
pub fn restore_tracking(
    record: Option<&TrackingRecord>,
    base_track_id: Option<&str>,
    image_id: &str,
    instance_id: u16,
) -> (String, Option<String>) {
    match record {
        Some(TrackingRecord {
            track_id: Some(track_id),
            track_name,
            ..
        }) => (track_id.clone(), track_name.clone()),
        Some(record) => (
            synthetic_track_id(base_track_id, image_id, instance_id),
            record.track_name.clone(),
        ),
        None => (synthetic_track_id(base_track_id, image_id, instance_id), None),
    }
}
