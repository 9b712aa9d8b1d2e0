//! Strategies for picking a session inside a pooled connection.

use crate::transport::connection::SessionSlot;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one open session out of a connection's sessions.
pub trait SessionSelector: Debug + Send + Sync + 'static {
    /// Index of the chosen session, or `None` if every session is closed.
    fn select(&self, sessions: &[SessionSlot]) -> Option<usize>;
}

/// Cycles through open sessions.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SessionSelector for RoundRobin {
    fn select(&self, sessions: &[SessionSlot]) -> Option<usize> {
        if sessions.is_empty() {
            return None;
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..sessions.len())
            .map(|offset| (start + offset) % sessions.len())
            .find(|&index| sessions[index].is_open())
    }
}

/// Picks the open session with the fewest calls in progress.
#[derive(Debug, Default)]
pub struct LeastPending;

impl SessionSelector for LeastPending {
    fn select(&self, sessions: &[SessionSlot]) -> Option<usize> {
        sessions
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_open())
            .min_by_key(|(_, slot)| slot.in_flight())
            .map(|(index, _)| index)
    }
}

/// Which selector new connections use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// [`RoundRobin`].
    #[default]
    RoundRobin,
    /// [`LeastPending`].
    LeastPending,
}

impl SelectionStrategy {
    /// Instantiate the strategy for one connection.
    #[must_use]
    pub fn build(self) -> Box<dyn SessionSelector> {
        match self {
            Self::RoundRobin => Box::<RoundRobin>::default(),
            Self::LeastPending => Box::new(LeastPending),
        }
    }
}
