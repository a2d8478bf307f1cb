//! Priority shared by the admission queue and the worker queue

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;

/// Scheduling priority
///
/// Ordering is by importance: `High > Medium > Low`. Both queues serve
/// higher priority first and fall back to arrival order among equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Rank used for sorting, lower is served first
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" | "normal" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(ResilienceError::validation(format!(
                "unknown priority '{other}', expected one of: high, medium, low"
            ))),
        }
    }
}

/// FIFO queue ordered by priority
///
/// Items are inserted after every item of equal or higher priority, so the
/// front is always the oldest item of the highest priority present.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    items: VecDeque<(Priority, T)>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Insert `item`, returning its position
    pub fn push(&mut self, priority: Priority, item: T) -> usize {
        let position = self
            .items
            .partition_point(|(p, _)| p.rank() <= priority.rank());
        self.items.insert(position, (priority, item));
        position
    }

    pub fn pop_front(&mut self) -> Option<(Priority, T)> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front().map(|(_, item)| item)
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut().map(|(_, item)| item)
    }

    /// Keep only items for which `keep` returns true, returning how many were removed
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|(_, item)| keep(item));
        before - self.items.len()
    }

    /// Remove and return every item, front first
    pub fn drain(&mut self) -> impl Iterator<Item = (Priority, T)> + '_ {
        self.items.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        self.items.iter().map(|(p, item)| (*p, item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
