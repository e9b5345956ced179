/// Backend selection strategies for routing groups
use crate::core::{Backend, RoutingStrategy};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection algorithm over the routable members of a group
pub trait SelectionAlgorithm: Send + Sync {
    /// Pick one of `backends`, returning its index
    fn select_backend(&self, backends: &[Backend]) -> Option<usize>;
}

/// Persistent cursor over a group's members
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionAlgorithm for RoundRobin {
    fn select_backend(&self, backends: &[Backend]) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(index)
    }
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct Random;

impl SelectionAlgorithm for Random {
    fn select_backend(&self, backends: &[Backend]) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..backends.len()))
    }
}

/// Candidates a strategy chooses among: routable members sorted by id
pub fn routable_members<'a, I>(backends: I) -> Vec<Backend>
where
    I: IntoIterator<Item = &'a Backend>,
{
    let mut members: Vec<Backend> = backends
        .into_iter()
        .filter(|b| b.is_routable())
        .cloned()
        .collect();
    members.sort_by(|a, b| a.id.cmp(&b.id));
    members
}

/// Apply `strategy` to `members`, using `cursor` for round robin
pub fn select<'a>(
    strategy: RoutingStrategy,
    cursor: &RoundRobin,
    members: &'a [Backend],
) -> Option<&'a Backend> {
    let index = match strategy {
        RoutingStrategy::Random => Random.select_backend(members),
        RoutingStrategy::RoundRobin => cursor.select_backend(members),
    }?;
    members.get(index)
}
