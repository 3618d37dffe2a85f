//! Unflushed-mutation tracking for one session.

/// Tracks whether a session holds mutations that have not been persisted.
///
/// Each open transaction level remembers the dirty state at its start. A
/// rollback that the engine actually honored restores that mark; a commit, or
/// a rollback the engine could not honor, keeps the current state.
#[derive(Debug, Default, Clone)]
pub struct DirtyTracker {
    dirty: bool,
    marks: Vec<bool>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// A statement that can mutate state completed successfully.
    pub fn mark(&mut self) {
        self.dirty = true;
    }

    /// A flush succeeded.
    pub fn clear(&mut self) {
        self.dirty = false;
    }

    /// A transaction level opened.
    pub fn enter(&mut self) {
        self.marks.push(self.dirty);
    }

    /// A transaction level committed.
    pub fn commit(&mut self) {
        self.marks.pop();
    }

    /// A transaction level rolled back. `discarded` says whether the engine
    /// really threw the level's changes away.
    pub fn rollback(&mut self, discarded: bool) {
        if let Some(mark) = self.marks.pop() {
            if discarded {
                self.dirty = mark;
            }
        }
    }

    /// Forget every open level, e.g. after a forced rollback on release.
    pub fn reset_levels(&mut self, discarded: bool) {
        if discarded {
            if let Some(&outer) = self.marks.first() {
                self.dirty = outer;
            }
        }
        self.marks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_mark() {
        let mut tracker = DirtyTracker::new();
        tracker.enter();
        tracker.mark();
        assert!(tracker.is_dirty());
        tracker.rollback(true);
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn rollback_keeps_outer_dirt() {
        let mut tracker = DirtyTracker::new();
        tracker.mark();
        tracker.enter();
        tracker.rollback(true);
        assert!(tracker.is_dirty());
    }

    #[test]
    fn inner_rollback_keeps_outer_level_dirt() {
        let mut tracker = DirtyTracker::new();
        tracker.enter();
        tracker.mark();
        tracker.enter();
        tracker.mark();
        tracker.rollback(true);
        assert!(tracker.is_dirty());
        tracker.commit();
        assert!(tracker.is_dirty());
    }

    #[test]
    fn unhonored_rollback_keeps_dirt() {
        let mut tracker = DirtyTracker::new();
        tracker.enter();
        tracker.enter();
        tracker.mark();
        tracker.rollback(false);
        assert!(tracker.is_dirty());
    }

    #[test]
    fn reset_levels_restores_outermost_mark() {
        let mut tracker = DirtyTracker::new();
        tracker.enter();
        tracker.mark();
        tracker.enter();
        tracker.reset_levels(true);
        assert!(!tracker.is_dirty());
    }
}
