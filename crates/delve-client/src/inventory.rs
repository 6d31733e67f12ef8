//! Gem inventory cache.
//!
//! Records are keyed by instance id. Occupancy (which gem sits in which
//! socket) is never stored by the server-facing mutators; it is derived
//! from the slot table by [`Inventory::recompute_occupancy`].

use std::collections::{BTreeMap, HashMap};

use delve_net::messages::{GemGrade, GemKind, GemRecord, InstanceId};

use crate::slots::{Occupancy, SlotTable};

/// Every owned gem plus where each equipped one sits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    gems: BTreeMap<InstanceId, GemRecord>,
    occupancy: HashMap<InstanceId, Occupancy>,
}

impl Inventory {
    pub fn get(&self, id: &str) -> Option<&GemRecord> {
        self.gems.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.gems.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.gems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gems.is_empty()
    }

    /// Gems ordered by instance id.
    pub fn iter(&self) -> impl Iterator<Item = &GemRecord> {
        self.gems.values()
    }

    /// Socket holding `id`, if equipped.
    pub fn occupancy_of(&self, id: &str) -> Option<&Occupancy> {
        self.occupancy.get(id)
    }

    pub fn is_equipped(&self, id: &str) -> bool {
        self.occupancy.contains_key(id)
    }

    /// Gems not sitting in any socket.
    pub fn unequipped(&self) -> impl Iterator<Item = &GemRecord> {
        self.gems
            .values()
            .filter(|gem| !self.occupancy.contains_key(&gem.instance_id))
    }

    /// Count of gems per (kind, grade).
    pub fn counts(&self) -> HashMap<(GemGrade, GemKind), usize> {
        let mut counts = HashMap::new();
        for gem in self.gems.values() {
            *counts.entry((gem.grade, gem.kind)).or_insert(0) += 1;
        }
        counts
    }

    /// Replace the whole set.
    pub(crate) fn apply_list(&mut self, gems: Vec<GemRecord>, slots: &SlotTable) {
        self.gems = gems
            .into_iter()
            .map(|gem| (gem.instance_id.clone(), gem))
            .collect();
        self.recompute_occupancy(slots);
    }

    /// Add or overwrite individual records.
    pub(crate) fn apply_grant(&mut self, gems: Vec<GemRecord>) {
        for gem in gems {
            self.gems.insert(gem.instance_id.clone(), gem);
        }
    }

    /// Drop the given ids. Returns how many were actually present.
    pub(crate) fn apply_removal(&mut self, ids: &[InstanceId]) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.gems.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Rebuild occupancy by scanning sockets in `slots`.
    pub(crate) fn recompute_occupancy(&mut self, slots: &SlotTable) {
        self.occupancy = slots
            .occupants()
            .map(|occ| (occ.instance_id.clone(), occ))
            .collect();
    }
}
