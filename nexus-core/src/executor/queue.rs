//! Three-tier pending-task queue.

use std::collections::VecDeque;

use super::task::{Job, Priority};

/// FIFO per tier; `pop` always serves the highest non-empty tier.
pub(crate) struct TaskQueue {
    tiers: [VecDeque<Job>; Priority::COUNT],
    len: usize,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, job: Job) {
        self.tiers[job.priority.index()].push_back(job);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<Job> {
        let job = self
            .tiers
            .iter_mut()
            .rev()
            .find_map(|tier| tier.pop_front())?;
        self.len -= 1;
        Some(job)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Remove every pending job, highest tier first.
    pub(crate) fn drain(&mut self) -> Vec<Job> {
        let mut drained = Vec::with_capacity(self.len);
        for tier in self.tiers.iter_mut().rev() {
            drained.extend(tier.drain(..));
        }
        self.len = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64, priority: Priority) -> Job {
        Job::new(id, priority, || Ok(())).0
    }

    #[test]
    fn test_higher_tier_first_fifo_within_tier() {
        let mut queue = TaskQueue::new();
        queue.push(job(1, Priority::Low));
        queue.push(job(2, Priority::High));
        queue.push(job(3, Priority::Normal));
        queue.push(job(4, Priority::High));
        assert_eq!(queue.len(), 4);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|j| j.id).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_drain_empties_all_tiers() {
        let mut queue = TaskQueue::new();
        queue.push(job(1, Priority::Low));
        queue.push(job(2, Priority::Normal));
        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }
}
