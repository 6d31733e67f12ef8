//! Pickaxe slot cache.
//!
//! Slots are keyed by index. Snapshots upsert: unknown indices are added,
//! known indices are overwritten wholesale. The aggregate DPS is recomputed
//! after every mutation.

use std::collections::BTreeMap;

use delve_net::messages::{InstanceId, ResourceSlot, SLOT_COUNT, SUB_SLOT_COUNT};

/// Where a gem sits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Occupancy {
    pub slot_index: u8,
    pub sub_slot_index: u8,
    pub instance_id: InstanceId,
}

/// Current view of every known slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotTable {
    slots: BTreeMap<u8, ResourceSlot>,
    total_dps: f64,
}

impl SlotTable {
    pub fn get(&self, index: u8) -> Option<&ResourceSlot> {
        self.slots.get(&index)
    }

    /// Slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceSlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sum of DPS over unlocked slots.
    pub fn total_dps(&self) -> f64 {
        self.total_dps
    }

    /// Every occupied socket, in slot then socket order.
    pub fn occupants(&self) -> impl Iterator<Item = Occupancy> + '_ {
        self.slots.values().flat_map(|slot| {
            slot.sub_slots.iter().filter_map(move |sub| {
                sub.occupant.as_ref().map(|id| Occupancy {
                    slot_index: slot.index,
                    sub_slot_index: sub.index,
                    instance_id: id.clone(),
                })
            })
        })
    }

    /// Upsert every valid slot in `slots`. Returns how many were rejected.
    pub(crate) fn apply_snapshot(&mut self, slots: impl IntoIterator<Item = ResourceSlot>) -> usize {
        let mut rejected = 0;
        for slot in slots {
            if !self.upsert(slot) {
                rejected += 1;
            }
        }
        self.recompute_total();
        rejected
    }

    /// Patch exactly one slot from an operation result.
    pub(crate) fn apply_single_result(&mut self, slot: ResourceSlot) -> bool {
        let accepted = self.upsert(slot);
        self.recompute_total();
        accepted
    }

    fn upsert(&mut self, mut slot: ResourceSlot) -> bool {
        if slot.index >= SLOT_COUNT {
            tracing::warn!(index = slot.index, "ignoring slot with out-of-range index");
            return false;
        }
        let before = slot.sub_slots.len();
        slot.sub_slots.retain(|sub| sub.index < SUB_SLOT_COUNT);
        if slot.sub_slots.len() != before {
            tracing::warn!(
                index = slot.index,
                dropped = before - slot.sub_slots.len(),
                "ignoring sub-slots with out-of-range index"
            );
        }
        slot.sub_slots.sort_by_key(|sub| sub.index);
        self.slots.insert(slot.index, slot);
        true
    }

    fn recompute_total(&mut self) {
        self.total_dps = self
            .slots
            .values()
            .filter(|slot| slot.unlocked)
            .map(|slot| slot.dps)
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_net::messages::SubSlot;

    fn slot(index: u8, dps: f64, unlocked: bool) -> ResourceSlot {
        ResourceSlot {
            index,
            level: 1,
            tier: 1,
            dps,
            unlocked,
            sub_slots: (0..SUB_SLOT_COUNT)
                .map(|i| SubSlot {
                    index: i,
                    unlocked: i == 0,
                    occupant: None,
                })
                .collect(),
            ..ResourceSlot::default()
        }
    }

    #[test]
    fn test_snapshot_adds_and_totals_unlocked_dps() {
        let mut table = SlotTable::default();
        let rejected = table.apply_snapshot([slot(0, 10.0, true), slot(1, 5.0, false)]);

        assert_eq!(rejected, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_dps(), 10.0);
    }

    #[test]
    fn test_snapshot_merges_by_index() {
        let mut table = SlotTable::default();
        table.apply_snapshot([slot(0, 10.0, true), slot(1, 5.0, true)]);
        table.apply_snapshot([slot(1, 7.0, true), slot(2, 1.0, true)]);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0).unwrap().dps, 10.0);
        assert_eq!(table.get(1).unwrap().dps, 7.0);
        assert_eq!(table.total_dps(), 18.0);
    }

    #[test]
    fn test_same_snapshot_twice_is_idempotent() {
        let snapshot = vec![slot(0, 10.0, true), slot(3, 2.5, true)];
        let mut once = SlotTable::default();
        once.apply_snapshot(snapshot.clone());

        let mut twice = once.clone();
        twice.apply_snapshot(snapshot);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_single_result_patches_one_slot() {
        let mut table = SlotTable::default();
        table.apply_snapshot([slot(0, 10.0, true), slot(1, 5.0, false)]);

        let mut upgraded = slot(1, 12.0, true);
        upgraded.level = 2;
        assert!(table.apply_single_result(upgraded));

        assert_eq!(table.get(1).unwrap().level, 2);
        assert_eq!(table.get(0).unwrap().dps, 10.0);
        assert_eq!(table.total_dps(), 22.0);
    }

    #[test]
    fn test_out_of_range_indices_are_skipped() {
        let mut table = SlotTable::default();
        let mut bad_sub = slot(2, 1.0, true);
        bad_sub.sub_slots.push(SubSlot {
            index: SUB_SLOT_COUNT,
            unlocked: true,
            occupant: Some("ghost".into()),
        });

        let rejected = table.apply_snapshot([slot(SLOT_COUNT, 99.0, true), bad_sub]);
        assert_eq!(rejected, 1);
        assert!(table.get(SLOT_COUNT).is_none());
        assert_eq!(table.get(2).unwrap().sub_slots.len(), SUB_SLOT_COUNT as usize);
        assert_eq!(table.occupants().count(), 0);
    }

    #[test]
    fn test_occupants_are_derived_from_sub_slots() {
        let mut a = slot(0, 1.0, true);
        a.sub_slots[2].occupant = Some("g1".into());
        let mut b = slot(1, 1.0, true);
        b.sub_slots[0].occupant = Some("g2".into());

        let mut table = SlotTable::default();
        table.apply_snapshot([b, a]);

        let occupants: Vec<_> = table.occupants().collect();
        assert_eq!(
            occupants,
            vec![
                Occupancy {
                    slot_index: 0,
                    sub_slot_index: 2,
                    instance_id: "g1".into()
                },
                Occupancy {
                    slot_index: 1,
                    sub_slot_index: 0,
                    instance_id: "g2".into()
                },
            ]
        );
    }
}
