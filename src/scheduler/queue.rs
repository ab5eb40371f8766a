use std::collections::{BTreeMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::inventory::ResourceId;

/// One FIFO of pending job ids per resource.
///
/// A job id is present in at most one queue, at most once.
#[derive(Debug, Default)]
pub struct PendingQueues {
    queues: BTreeMap<ResourceId, VecDeque<Uuid>>,
    queued: HashSet<Uuid>,
}

impl PendingQueues {
    pub fn new<I>(resources: I) -> Self
    where
        I: IntoIterator<Item = ResourceId>,
    {
        Self {
            queues: resources
                .into_iter()
                .map(|id| (id, VecDeque::new()))
                .collect(),
            queued: HashSet::new(),
        }
    }

    /// Append a job to its resource's queue. Returns false if the resource is
    /// unknown or the job is already queued somewhere.
    pub fn push(&mut self, resource: &ResourceId, job_id: Uuid) -> bool {
        if self.queued.contains(&job_id) {
            return false;
        }
        match self.queues.get_mut(resource) {
            Some(queue) => {
                queue.push_back(job_id);
                self.queued.insert(job_id);
                true
            }
            None => false,
        }
    }

    /// Take the oldest pending job for a resource.
    pub fn pop(&mut self, resource: &ResourceId) -> Option<Uuid> {
        let job_id = self.queues.get_mut(resource)?.pop_front()?;
        self.queued.remove(&job_id);
        Some(job_id)
    }

    /// Remove a job wherever it is queued. Returns true if it was found.
    pub fn remove(&mut self, job_id: &Uuid) -> bool {
        if !self.queued.remove(job_id) {
            return false;
        }
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|id| id == job_id) {
                queue.remove(pos);
                break;
            }
        }
        true
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.queued.contains(job_id)
    }

    /// Queued job ids for a resource, oldest first.
    pub fn pending_for(&self, resource: &ResourceId) -> Vec<Uuid> {
        self.queues
            .get(resource)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, resource: &ResourceId) -> usize {
        self.queues.get(resource).map(VecDeque::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> PendingQueues {
        PendingQueues::new([ResourceId::cpu(), ResourceId::gpu(0)])
    }

    #[test]
    fn fifo_per_resource() {
        let mut q = queues();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(q.push(&ResourceId::gpu(0), a));
        assert!(q.push(&ResourceId::cpu(), c));
        assert!(q.push(&ResourceId::gpu(0), b));

        assert_eq!(q.depth(&ResourceId::gpu(0)), 2);
        assert_eq!(q.pop(&ResourceId::gpu(0)), Some(a));
        assert_eq!(q.pop(&ResourceId::gpu(0)), Some(b));
        assert_eq!(q.pop(&ResourceId::gpu(0)), None);
        assert_eq!(q.pop(&ResourceId::cpu()), Some(c));
        assert!(q.is_empty());
    }

    #[test]
    fn rejects_duplicates_and_unknown_resources() {
        let mut q = queues();
        let a = Uuid::new_v4();
        assert!(q.push(&ResourceId::cpu(), a));
        assert!(!q.push(&ResourceId::cpu(), a));
        assert!(!q.push(&ResourceId::gpu(0), a));
        assert!(!q.push(&ResourceId::gpu(9), Uuid::new_v4()));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_from_middle_keeps_order() {
        let mut q = queues();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.push(&ResourceId::gpu(0), *id);
        }
        assert!(q.remove(&ids[1]));
        assert!(!q.remove(&ids[1]));
        assert!(!q.contains(&ids[1]));
        assert_eq!(q.pending_for(&ResourceId::gpu(0)), vec![ids[0], ids[2]]);
    }
}
