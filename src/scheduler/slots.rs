//! Slot pool
//!
//! `n_parallel` lanes share `n_batch` batch units. A request occupies one lane
//! and reserves its `batch_units` until it is retired.

use super::request::RequestId;
use crate::engine::SlotId;

/// Whether a request of a given size can be admitted now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Fits,
    /// Capacity frees up once running requests finish
    Wait,
    /// Larger than the whole pool
    Never,
}

#[derive(Debug, Clone)]
pub(crate) struct SlotPool {
    n_batch: usize,
    lanes: Vec<Option<(RequestId, usize)>>,
    used_units: usize,
}

impl SlotPool {
    pub fn new(n_parallel: usize, n_batch: usize) -> Self {
        Self {
            n_batch,
            lanes: vec![None; n_parallel.max(1)],
            used_units: 0,
        }
    }

    /// The single lane of non-parallel mode
    pub fn single(n_batch: usize) -> Self {
        Self::new(1, n_batch)
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn admission(&self, units: usize) -> Admission {
        if units > self.n_batch {
            Admission::Never
        } else if self.lanes.iter().all(Option::is_some)
            || self.used_units + units > self.n_batch
        {
            Admission::Wait
        } else {
            Admission::Fits
        }
    }

    /// Bind `id` to the lowest free lane
    pub fn acquire(&mut self, id: RequestId, units: usize) -> Option<SlotId> {
        if self.admission(units) != Admission::Fits {
            return None;
        }
        let slot = self.lanes.iter().position(Option::is_none)?;
        self.lanes[slot] = Some((id, units));
        self.used_units += units;
        Some(slot)
    }

    pub fn release(&mut self, slot: SlotId) -> Option<RequestId> {
        let (id, units) = self.lanes.get_mut(slot)?.take()?;
        self.used_units -= units;
        Some(id)
    }

    pub fn active_count(&self) -> usize {
        self.lanes.iter().filter(|lane| lane.is_some()).count()
    }

    pub fn used_units(&self) -> usize {
        self.used_units
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::new(n)
    }

    #[test]
    fn test_batch_capacity_is_shared() {
        let mut pool = SlotPool::new(2, 8);
        assert_eq!(pool.acquire(id(1), 4), Some(0));
        assert_eq!(pool.acquire(id(2), 4), Some(1));
        assert_eq!(pool.used_units(), 8);
        assert_eq!(pool.admission(1), Admission::Wait);

        assert_eq!(pool.release(0), Some(id(1)));
        assert_eq!(pool.admission(4), Admission::Fits);
        assert_eq!(pool.acquire(id(3), 4), Some(0));
        assert!(pool.used_units() <= pool.n_batch());
    }

    #[test]
    fn test_units_limit_before_lanes() {
        let mut pool = SlotPool::new(3, 8);
        assert_eq!(pool.acquire(id(1), 6), Some(0));
        assert_eq!(pool.admission(3), Admission::Wait);
        assert_eq!(pool.acquire(id(2), 2), Some(1));
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn test_oversized_request_never_fits() {
        let pool = SlotPool::single(4);
        assert_eq!(pool.admission(5), Admission::Never);
        assert_eq!(pool.admission(4), Admission::Fits);
    }

    #[test]
    fn test_release_of_empty_lane() {
        let mut pool = SlotPool::single(4);
        assert_eq!(pool.release(0), None);
        assert_eq!(pool.release(7), None);
    }
}
