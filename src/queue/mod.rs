#![forbid(unsafe_code)]

// Durable two-stage work queue — leave stage, delete stage and an error sink
// behind a storage-agnostic backend trait.

pub mod memory;
pub mod redis;

use crate::ids::{RoomId, UserId};
use crate::metrics::ServiceMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// A room that passed eligibility checks, with the members to evict.
/// Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    #[serde(rename = "kick")]
    pub kick: Vec<UserId>,
}

/// A room awaiting deletion. The enqueue timestamp implements the
/// postponement window: the room is not eligible for purge before
/// `queued_at + postpone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRoom {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    #[serde(rename = "queueTime")]
    pub queued_at: SystemTime,
}

impl PendingRoom {
    pub fn now(room_id: RoomId) -> Self {
        Self {
            room_id,
            queued_at: SystemTime::now(),
        }
    }

    pub fn is_due(&self, postpone: Duration, now: SystemTime) -> bool {
        self.queued_at + postpone <= now
    }
}

/// A persisted delete-stage payload. Older deployments stored bare room IDs;
/// those are treated as immediately due.
#[derive(Debug, PartialEq)]
pub enum StoredPending {
    Timed(PendingRoom),
    Legacy(RoomId),
}

impl StoredPending {
    pub fn decode(payload: &str) -> Self {
        if let Ok(pending) = serde_json::from_str::<PendingRoom>(payload) {
            return Self::Timed(pending);
        }
        // Any other JSON object carrying a roomID also counts as a room; a
        // payload that is not JSON at all is a legacy bare room ID.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
            if let Some(room) = value.get("roomID").and_then(|v| v.as_str()) {
                return Self::Legacy(RoomId::new(room));
            }
            if let Some(room) = value.as_str() {
                return Self::Legacy(RoomId::new(room));
            }
        }
        Self::Legacy(RoomId::new(payload))
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Timed(pending) => &pending.room_id,
            Self::Legacy(room) => room,
        }
    }

    pub fn is_due(&self, postpone: Duration, now: SystemTime) -> bool {
        match self {
            Self::Timed(pending) => pending.is_due(postpone, now),
            Self::Legacy(_) => true,
        }
    }
}

/// Outcome of a delete-stage pop.
#[derive(Debug)]
pub enum DeletePop {
    Item(PendingRoom),
    /// The head of the queue has not dwelled past the postponement window yet.
    NotReady,
    /// Nothing queued, or the pop was cancelled.
    Idle,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueDepths {
    pub leave: u64,
    pub delete: u64,
    pub error: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Closed,
    #[error("failed to encode queue item: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
}

/// Storage contract shared by the in-memory and redis backends. Selected once
/// at startup; the rest of the service only sees this trait.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push_leave(&self, item: LeaveRequest) -> Result<(), QueueError>;
    async fn push_delete(&self, item: PendingRoom) -> Result<(), QueueError>;
    /// Wait for the next leave item; returns None when cancelled.
    async fn pop_leave(&self, cancel: &CancellationToken) -> Option<LeaveRequest>;
    /// Take the next delete item if its dwell time has elapsed.
    async fn pop_delete(&self, cancel: &CancellationToken, postpone: Duration) -> DeletePop;
    /// Record a permanently failed room. Fire-and-forget.
    async fn push_error(&self, room: &RoomId);
    async fn depths(&self) -> QueueDepths;
}

/// The two-stage queue with metrics bookkeeping. Cheap to clone.
#[derive(Clone)]
pub struct Queues {
    backend: Arc<dyn QueueBackend>,
    metrics: ServiceMetrics,
}

impl Queues {
    pub fn new(backend: Arc<dyn QueueBackend>, metrics: ServiceMetrics) -> Self {
        Self { backend, metrics }
    }

    pub fn in_memory(metrics: ServiceMetrics) -> Self {
        Self::new(Arc::new(memory::MemoryBackend::new()), metrics)
    }

    pub async fn redis(
        url: &str,
        dry_run: bool,
        metrics: ServiceMetrics,
    ) -> Result<Self, QueueError> {
        let backend = redis::RedisBackend::connect(url, dry_run).await?;
        Ok(Self::new(Arc::new(backend), metrics))
    }

    pub async fn push_leave(&self, room_id: RoomId, kick: Vec<UserId>) -> Result<(), QueueError> {
        let result = self.backend.push_leave(LeaveRequest { room_id, kick }).await;
        self.refresh_gauges().await;
        result
    }

    pub async fn push_delete(&self, room_id: RoomId) -> Result<(), QueueError> {
        let result = self.backend.push_delete(PendingRoom::now(room_id)).await;
        self.refresh_gauges().await;
        result
    }

    pub async fn pop_leave(&self, cancel: &CancellationToken) -> Option<LeaveRequest> {
        let item = self.backend.pop_leave(cancel).await;
        self.refresh_gauges().await;
        item
    }

    pub async fn pop_delete(&self, cancel: &CancellationToken, postpone: Duration) -> DeletePop {
        let outcome = self.backend.pop_delete(cancel, postpone).await;
        self.refresh_gauges().await;
        outcome
    }

    pub async fn push_error(&self, room: &RoomId) {
        self.backend.push_error(room).await;
        self.refresh_gauges().await;
    }

    pub async fn depths(&self) -> QueueDepths {
        self.backend.depths().await
    }

    async fn refresh_gauges(&self) {
        let depths = self.backend.depths().await;
        self.metrics
            .set_queue_depths(depths.leave, depths.delete, depths.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_room_due_after_postponement() {
        let pending = PendingRoom {
            room_id: RoomId::new("!r:hs"),
            queued_at: SystemTime::UNIX_EPOCH,
        };
        let postpone = Duration::from_secs(3600);
        assert!(!pending.is_due(postpone, SystemTime::UNIX_EPOCH + Duration::from_secs(10)));
        assert!(pending.is_due(postpone, SystemTime::UNIX_EPOCH + Duration::from_secs(3600)));
    }

    #[test]
    fn test_stored_pending_roundtrip() {
        let pending = PendingRoom::now(RoomId::new("!r:hs"));
        let payload = serde_json::to_string(&pending).unwrap();
        assert_eq!(
            StoredPending::decode(&payload),
            StoredPending::Timed(pending)
        );
    }

    #[test]
    fn test_stored_pending_legacy_bare_room_id() {
        let stored = StoredPending::decode("!old:hs");
        assert_eq!(stored, StoredPending::Legacy(RoomId::new("!old:hs")));
        assert!(stored.is_due(Duration::from_secs(86400), SystemTime::now()));
    }

    #[test]
    fn test_stored_pending_foreign_timestamp_format_is_due_now() {
        // Entries written by older software with a different time encoding
        // must still resolve to their room and count as due.
        let stored =
            StoredPending::decode(r#"{"roomID":"!old:hs","queueTime":"2021-09-01T00:00:00Z"}"#);
        assert_eq!(stored.room_id(), &RoomId::new("!old:hs"));
        assert!(stored.is_due(Duration::from_secs(86400), SystemTime::now()));
    }
}
