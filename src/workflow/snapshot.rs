use super::entity::Entity;

/// Two-slot holder for the last confirmed entity and an in-flight candidate.
///
/// Commit and rollback only move the `confirmed` index or clear the
/// candidate slot; no field-level diffing is involved.
#[derive(Debug, Clone)]
pub struct SnapshotPair {
    slots: [Option<Entity>; 2],
    confirmed: usize,
}

impl SnapshotPair {
    pub fn new(confirmed: Entity) -> Self {
        Self {
            slots: [Some(confirmed), None],
            confirmed: 0,
        }
    }

    fn candidate_slot(&self) -> usize {
        1 - self.confirmed
    }

    pub fn confirmed(&self) -> &Entity {
        // The confirmed slot is populated at construction and only swapped
        // with a populated candidate slot.
        self.slots[self.confirmed]
            .as_ref()
            .unwrap_or_else(|| unreachable!("confirmed slot is never empty"))
    }

    pub fn candidate(&self) -> Option<&Entity> {
        self.slots[self.candidate_slot()].as_ref()
    }

    /// Stages a candidate, replacing any previous one.
    pub fn stage(&mut self, candidate: Entity) -> &Entity {
        let slot = self.candidate_slot();
        self.slots[slot].insert(candidate)
    }

    /// Promotes the candidate to confirmed. Returns the newly confirmed value.
    pub fn commit(&mut self) -> &Entity {
        let slot = self.candidate_slot();
        if self.slots[slot].is_some() {
            self.confirmed = slot;
            self.slots[1 - slot] = None;
        }
        self.confirmed()
    }

    /// Drops the candidate. Returns the restored confirmed value.
    pub fn rollback(&mut self) -> &Entity {
        let slot = self.candidate_slot();
        self.slots[slot] = None;
        self.confirmed()
    }

    pub fn into_confirmed(mut self) -> Entity {
        self.slots[self.confirmed]
            .take()
            .unwrap_or_else(|| unreachable!("confirmed slot is never empty"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStatus;

    #[test]
    fn test_commit_swaps_slots() {
        let mut pair = SnapshotPair::new(Entity::pending("b-1"));
        let mut next = Entity::pending("b-1");
        next.workflow_status = WorkflowStatus::Approved;

        pair.stage(next.clone());
        assert_eq!(pair.candidate(), Some(&next));

        assert_eq!(pair.commit(), &next);
        assert!(pair.candidate().is_none());
        assert_eq!(pair.into_confirmed(), next);
    }

    #[test]
    fn test_rollback_restores_confirmed() {
        let original = Entity::pending("b-1");
        let mut pair = SnapshotPair::new(original.clone());
        let mut next = original.clone();
        next.is_paid = true;

        pair.stage(next);
        assert_eq!(pair.rollback(), &original);
        assert!(pair.candidate().is_none());
    }

    #[test]
    fn test_commit_without_candidate_keeps_confirmed() {
        let original = Entity::pending("b-1");
        let mut pair = SnapshotPair::new(original.clone());
        assert_eq!(pair.commit(), &original);
    }
}
