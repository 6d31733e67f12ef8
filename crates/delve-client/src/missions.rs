//! Mission board cache.
//!
//! Missions are indexed twice: by slot number (primary) and by mission id.
//! A progress update may carry either key; slot number is tried first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use delve_net::messages::{
    MilestoneState, MissionList, MissionProgress, MissionRecord, MissionStatus, MissionSummary,
};

/// Milestone rewards for the current reset window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Milestones {
    pub completed_count: u32,
    pub claimed: BTreeSet<u32>,
    pub reset_at: u64,
}

impl From<MilestoneState> for Milestones {
    fn from(state: MilestoneState) -> Self {
        Self {
            completed_count: state.completed_count,
            claimed: state.claimed_milestones.into_iter().collect(),
            reset_at: state.reset_at,
        }
    }
}

/// Current missions, aggregates, milestones and ad counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionBoard {
    by_slot: BTreeMap<u32, MissionRecord>,
    slot_of_mission: HashMap<u32, u32>,
    summary: MissionSummary,
    milestones: Milestones,
    ad_counts: BTreeMap<String, u32>,
}

impl MissionBoard {
    pub fn by_slot(&self, slot_no: u32) -> Option<&MissionRecord> {
        self.by_slot.get(&slot_no)
    }

    pub fn by_mission_id(&self, mission_id: u32) -> Option<&MissionRecord> {
        self.slot_of_mission
            .get(&mission_id)
            .and_then(|slot| self.by_slot.get(slot))
    }

    /// Missions in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &MissionRecord> {
        self.by_slot.values()
    }

    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn summary(&self) -> &MissionSummary {
        &self.summary
    }

    pub fn milestones(&self) -> &Milestones {
        &self.milestones
    }

    pub fn ad_count(&self, ad_type: &str) -> u32 {
        self.ad_counts.get(ad_type).copied().unwrap_or(0)
    }

    pub fn ad_counts(&self) -> &BTreeMap<String, u32> {
        &self.ad_counts
    }

    /// Missions ready to claim.
    pub fn claimable(&self) -> impl Iterator<Item = &MissionRecord> {
        self.by_slot
            .values()
            .filter(|m| m.status == MissionStatus::Completed)
    }

    /// Full replace of the board.
    pub(crate) fn apply_list(&mut self, list: MissionList) {
        self.by_slot.clear();
        self.slot_of_mission.clear();
        for mission in list.missions {
            self.upsert(mission);
        }
        self.summary = list.summary;
        self.milestones = list.milestones.into();
        self.ad_counts = list.ad_counts;
    }

    /// Apply a progress update. Returns `false` if neither key resolves.
    pub(crate) fn apply_progress(&mut self, progress: &MissionProgress) -> bool {
        let slot = progress
            .slot_no
            .filter(|slot| self.by_slot.contains_key(slot))
            .or_else(|| self.slot_of_mission.get(&progress.mission_id).copied());

        let Some(mission) = slot.and_then(|slot| self.by_slot.get_mut(&slot)) else {
            tracing::debug!(
                slot_no = ?progress.slot_no,
                mission_id = progress.mission_id,
                "progress for unknown mission ignored"
            );
            return false;
        };

        let was_completed = mission.status != MissionStatus::InProgress;
        mission.current_value = progress.current_value;
        mission.status = progress.status;
        if !was_completed && mission.status == MissionStatus::Completed {
            self.summary.completed_count = self.summary.completed_count.saturating_add(1);
        }
        true
    }

    /// Replace one mission (claim or reroll result).
    pub(crate) fn apply_mission(&mut self, mission: MissionRecord) {
        self.upsert(mission);
    }

    pub(crate) fn apply_reroll_counts(&mut self, used: u32, free: u32) {
        self.summary.rerolls_used = used;
        self.summary.rerolls_free = free;
    }

    pub(crate) fn apply_milestone_claimed(&mut self, milestone: u32) {
        self.milestones.claimed.insert(milestone);
    }

    pub(crate) fn apply_ad_count(&mut self, ad_type: String, count_today: u32) {
        self.ad_counts.insert(ad_type, count_today);
    }

    /// Both indices name each mission at most once: a mission id that moves
    /// to another slot vacates its old slot.
    fn upsert(&mut self, mission: MissionRecord) {
        if let Some(old) = self.by_slot.get(&mission.slot_no)
            && old.mission_id != mission.mission_id
        {
            self.slot_of_mission.remove(&old.mission_id);
        }
        if let Some(previous_slot) = self.slot_of_mission.get(&mission.mission_id).copied()
            && previous_slot != mission.slot_no
        {
            self.by_slot.remove(&previous_slot);
        }
        self.slot_of_mission
            .insert(mission.mission_id, mission.slot_no);
        self.by_slot.insert(mission.slot_no, mission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mission(slot_no: u32, mission_id: u32) -> MissionRecord {
        MissionRecord {
            slot_no,
            mission_id,
            current_value: 0,
            target_value: 10,
            status: MissionStatus::InProgress,
        }
    }

    fn board() -> MissionBoard {
        let mut board = MissionBoard::default();
        board.apply_list(MissionList {
            missions: vec![mission(1, 100), mission(2, 200)],
            summary: MissionSummary {
                rerolls_free: 3,
                ..MissionSummary::default()
            },
            milestones: MilestoneState {
                completed_count: 0,
                claimed_milestones: vec![5],
                reset_at: 1_000,
            },
            ad_counts: BTreeMap::from([("reroll".to_string(), 1)]),
        });
        board
    }

    fn progress(slot_no: Option<u32>, mission_id: u32, value: u64) -> MissionProgress {
        MissionProgress {
            slot_no,
            mission_id,
            current_value: value,
            status: MissionStatus::InProgress,
        }
    }

    #[test]
    fn test_list_builds_both_indices() {
        let board = board();
        assert_eq!(board.len(), 2);
        assert_eq!(board.by_slot(2).unwrap().mission_id, 200);
        assert_eq!(board.by_mission_id(100).unwrap().slot_no, 1);
        assert!(board.milestones().claimed.contains(&5));
        assert_eq!(board.ad_count("reroll"), 1);
        assert_eq!(board.ad_count("other"), 0);
    }

    #[test]
    fn test_same_list_twice_is_idempotent() {
        let once = board();
        let mut twice = once.clone();
        twice.apply_list(MissionList {
            missions: vec![mission(1, 100), mission(2, 200)],
            summary: MissionSummary {
                rerolls_free: 3,
                ..MissionSummary::default()
            },
            milestones: MilestoneState {
                completed_count: 0,
                claimed_milestones: vec![5],
                reset_at: 1_000,
            },
            ad_counts: BTreeMap::from([("reroll".to_string(), 1)]),
        });
        assert_eq!(once, twice);
    }

    #[test]
    fn test_progress_resolves_by_slot_first() {
        let mut board = board();
        // Slot 2 wins even though mission id 100 lives in slot 1.
        assert!(board.apply_progress(&progress(Some(2), 100, 7)));
        assert_eq!(board.by_slot(2).unwrap().current_value, 7);
        assert_eq!(board.by_slot(1).unwrap().current_value, 0);
    }

    #[test]
    fn test_progress_falls_back_to_mission_id() {
        let mut board = board();
        assert!(board.apply_progress(&progress(None, 200, 4)));
        assert!(board.apply_progress(&progress(Some(9), 100, 6)));
        assert_eq!(board.by_slot(2).unwrap().current_value, 4);
        assert_eq!(board.by_slot(1).unwrap().current_value, 6);
    }

    #[test]
    fn test_progress_for_unknown_mission_is_ignored() {
        let mut board = board();
        let before = board.clone();
        assert!(!board.apply_progress(&progress(Some(9), 999, 1)));
        assert_eq!(board, before);
    }

    #[test]
    fn test_completion_bumps_completed_count_once() {
        let mut board = board();
        let done = MissionProgress {
            status: MissionStatus::Completed,
            ..progress(Some(1), 100, 10)
        };
        board.apply_progress(&done);
        board.apply_progress(&done);
        assert_eq!(board.summary().completed_count, 1);
        assert_eq!(board.claimable().count(), 1);
    }

    #[test]
    fn test_completed_count_saturates() {
        let mut board = board();
        board.summary.completed_count = u32::MAX;
        let done = MissionProgress {
            status: MissionStatus::Completed,
            ..progress(Some(1), 100, 10)
        };
        assert!(board.apply_progress(&done));
        assert_eq!(board.summary().completed_count, u32::MAX);
    }

    #[test]
    fn test_mission_moving_slots_vacates_old_slot() {
        let mut board = board();
        board.apply_mission(mission(3, 100));

        assert!(board.by_slot(1).is_none());
        assert_eq!(board.by_mission_id(100).unwrap().slot_no, 3);
        assert_eq!(board.len(), 2);

        // Progress keyed by the vacated slot falls back to the live record.
        assert!(board.apply_progress(&progress(Some(1), 100, 8)));
        assert_eq!(board.by_slot(3).unwrap().current_value, 8);
    }

    #[test]
    fn test_reroll_replaces_mission_and_reindexes() {
        let mut board = board();
        board.apply_mission(mission(1, 300));
        board.apply_reroll_counts(1, 2);

        assert!(board.by_mission_id(100).is_none());
        assert_eq!(board.by_mission_id(300).unwrap().slot_no, 1);
        assert_eq!(board.summary().rerolls_used, 1);
        assert_eq!(board.summary().rerolls_free, 2);
    }

    #[test]
    fn test_milestone_and_ad_updates() {
        let mut board = board();
        board.apply_milestone_claimed(10);
        board.apply_ad_count("reroll".to_string(), 2);
        assert_eq!(
            board.milestones().claimed.iter().copied().collect::<Vec<_>>(),
            vec![5, 10]
        );
        assert_eq!(board.ad_count("reroll"), 2);
    }
}
