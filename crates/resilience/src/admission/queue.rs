//! Waiting requests

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ResilienceError;
use crate::priority::Priority;

/// A request waiting for admission
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub endpoint: String,
    /// Estimated token cost
    pub cost: u64,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Admission backoff rounds already spent
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedRequest {
    pub fn new(endpoint: impl Into<String>, cost: u64, priority: Priority, max_retries: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            endpoint: endpoint.into(),
            cost,
            priority,
            enqueued_at: Instant::now(),
            retry_count: 0,
            max_retries,
        }
    }
}

/// Queued request plus the channel its caller waits on
#[derive(Debug)]
pub(crate) struct Waiter {
    pub request: QueuedRequest,
    pub responder: oneshot::Sender<Result<(), ResilienceError>>,
}

impl Waiter {
    /// The caller stopped waiting
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// Hand the decision to the caller; `false` if the caller went away
    pub fn respond(self, result: Result<(), ResilienceError>) -> bool {
        self.responder.send(result).is_ok()
    }
}

/// Read-only view of the admission queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub depth: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_endpoint: BTreeMap<String, usize>,
    /// Enqueue time of the request that has waited longest
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    /// Requests in service order
    pub entries: Vec<QueueEntry>,
}

/// One request in a [`QueueInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub endpoint: String,
    pub cost: u64,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}
