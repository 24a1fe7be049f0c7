/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Admission & deferral queue.
//!
//! FIFO of tasks that could not be placed when they arrived. The engine
//! re-scans the *whole* queue on every capacity-freeing event; a task whose
//! CPU type is still unavailable never blocks compatible tasks queued behind
//! it.

use std::collections::{HashSet, VecDeque};

use tracing::warn;

use crate::types::TaskId;

#[derive(Debug, Default)]
pub struct DeferralQueue {
    order: VecDeque<TaskId>,
    members: HashSet<TaskId>,
}

impl DeferralQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `task`. A task that is already queued keeps its position.
    pub fn push_back(&mut self, task: TaskId) -> bool {
        if !self.members.insert(task) {
            warn!(task = %task, "task already deferred, keeping original position");
            return false;
        }
        self.order.push_back(task);
        true
    }

    /// Puts `task` at the head of the queue, moving it if already queued.
    pub fn push_front(&mut self, task: TaskId) {
        if self.members.contains(&task) {
            self.order.retain(|&t| t != task);
        } else {
            self.members.insert(task);
        }
        self.order.push_front(task);
    }

    pub fn remove(&mut self, task: TaskId) -> bool {
        if !self.members.remove(&task) {
            return false;
        }
        self.order.retain(|&t| t != task);
        true
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.members.contains(&task)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().copied()
    }

    /// Empties the queue, returning its tasks in FIFO order.
    ///
    /// Used for a full re-scan: tasks that still cannot be placed are pushed
    /// back in the same order they come out.
    pub fn take_all(&mut self) -> Vec<TaskId> {
        self.members.clear();
        self.order.drain(..).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(ids: &[u32]) -> DeferralQueue {
        let mut q = DeferralQueue::new();
        for &id in ids {
            q.push_back(TaskId(id));
        }
        q
    }

    #[test]
    fn preserves_fifo_order() {
        let q = queue(&[3, 1, 2]);
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![TaskId(3), TaskId(1), TaskId(2)]);
    }

    #[test]
    fn duplicate_push_keeps_first_position() {
        let mut q = queue(&[1, 2]);
        assert!(!q.push_back(TaskId(1)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.iter().next(), Some(TaskId(1)));
    }

    #[test]
    fn push_front_moves_existing_task() {
        let mut q = queue(&[1, 2, 3]);
        q.push_front(TaskId(3));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![TaskId(3), TaskId(1), TaskId(2)]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn remove_from_middle() {
        let mut q = queue(&[1, 2, 3]);
        assert!(q.remove(TaskId(2)));
        assert!(!q.remove(TaskId(2)));
        assert!(!q.contains(TaskId(2)));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![TaskId(1), TaskId(3)]);
    }

    #[test]
    fn take_all_empties_queue_in_order() {
        let mut q = queue(&[5, 6]);
        assert_eq!(q.take_all(), vec![TaskId(5), TaskId(6)]);
        assert!(q.is_empty());
        assert!(!q.contains(TaskId(5)));
        assert!(q.push_back(TaskId(5)));
    }
}
