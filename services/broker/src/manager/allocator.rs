//! Identifier pool.
//!
//! Resource ids come from the bounded domain `0..domain`. An id stays in the
//! pool from reservation until its backing resource is confirmed deleted (or
//! its creation is abandoned), so two live resources never share one.

use std::collections::HashSet;

use rand::Rng;
use vmlease_id::ResourceId;

/// Candidate draws attempted before giving up.
pub const MAX_TRY: u32 = 5;

/// Default size of the id domain.
pub const DEFAULT_DOMAIN: u32 = 1000;

#[derive(Debug)]
pub struct IdentifierPool {
    domain: u32,
    reserved: HashSet<ResourceId>,
}

impl IdentifierPool {
    pub fn new(domain: u32) -> Self {
        Self {
            domain: domain.max(1),
            reserved: HashSet::new(),
        }
    }

    /// Reserve a random free id. Returns `None` after [`MAX_TRY`] collisions.
    pub fn reserve(&mut self) -> Option<ResourceId> {
        let domain = self.domain;
        let mut rng = rand::rng();
        self.reserve_with(|| rng.random_range(0..domain))
    }

    /// Reserve using `next` as the candidate source.
    pub fn reserve_with(&mut self, mut next: impl FnMut() -> u32) -> Option<ResourceId> {
        for _ in 0..MAX_TRY {
            let candidate = ResourceId::new(next() % self.domain);
            if self.reserved.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Mark a specific id as reserved (e.g. one recovered from a snapshot).
    /// Returns false if it was already held.
    pub fn seed(&mut self, id: ResourceId) -> bool {
        self.reserved.insert(id)
    }

    /// Return an id to the pool.
    pub fn release(&mut self, id: ResourceId) -> bool {
        self.reserved.remove(&id)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.reserved.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

impl Default for IdentifierPool {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_never_collides() {
        let mut pool = IdentifierPool::new(64);
        let mut seen = HashSet::new();
        for _ in 0..32 {
            if let Some(id) = pool.reserve() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(pool.len(), seen.len());
    }

    #[test]
    fn test_reserve_with_skips_taken_candidates() {
        let mut pool = IdentifierPool::new(1000);
        assert!(pool.seed(ResourceId::new(5)));

        let mut candidates = [5, 5, 9].into_iter();
        let id = pool.reserve_with(|| candidates.next().unwrap_or(0));
        assert_eq!(id, Some(ResourceId::new(9)));
    }

    #[test]
    fn test_exhaustion_after_max_try_collisions() {
        let mut pool = IdentifierPool::new(1000);
        pool.seed(ResourceId::new(1));

        let mut draws = 0;
        let id = pool.reserve_with(|| {
            draws += 1;
            1
        });
        assert_eq!(id, None);
        assert_eq!(draws, MAX_TRY);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_full_domain_exhausts() {
        let mut pool = IdentifierPool::new(2);
        pool.seed(ResourceId::new(0));
        pool.seed(ResourceId::new(1));
        assert_eq!(pool.reserve(), None);
    }

    #[test]
    fn test_release_makes_id_reusable() {
        let mut pool = IdentifierPool::new(1000);
        let id = pool.reserve_with(|| 3).unwrap();
        assert!(pool.contains(id));
        assert!(pool.release(id));
        assert!(!pool.contains(id));
        assert_eq!(pool.reserve_with(|| 3), Some(id));
    }

    #[test]
    fn test_seed_reports_duplicates() {
        let mut pool = IdentifierPool::default();
        assert!(pool.seed(ResourceId::new(10)));
        assert!(!pool.seed(ResourceId::new(10)));
    }
}
