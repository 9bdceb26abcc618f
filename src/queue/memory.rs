#![forbid(unsafe_code)]

// In-process queue backend — bounded channels, process lifetime only.

use super::{DeletePop, LeaveRequest, PendingRoom, QueueBackend, QueueDepths, QueueError};
use crate::ids::RoomId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const QUEUE_CAPACITY: usize = 8192;

/// Bounded in-process buffers. Postponement does not apply here: items become
/// eligible as soon as they are popped, matching the original in-memory path.
pub struct MemoryBackend {
    leave_tx: mpsc::Sender<LeaveRequest>,
    leave_rx: Mutex<mpsc::Receiver<LeaveRequest>>,
    delete_tx: mpsc::Sender<PendingRoom>,
    delete_rx: Mutex<mpsc::Receiver<PendingRoom>>,
    leave_len: AtomicU64,
    delete_len: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (leave_tx, leave_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (delete_tx, delete_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            leave_tx,
            leave_rx: Mutex::new(leave_rx),
            delete_tx,
            delete_rx: Mutex::new(delete_rx),
            leave_len: AtomicU64::new(0),
            delete_len: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push_leave(&self, item: LeaveRequest) -> Result<(), QueueError> {
        // Blocks for backpressure when the buffer is full.
        self.leave_tx
            .send(item)
            .await
            .map_err(|_| QueueError::Closed)?;
        self.leave_len.fetch_add(1, Relaxed);
        Ok(())
    }

    async fn push_delete(&self, item: PendingRoom) -> Result<(), QueueError> {
        self.delete_tx
            .send(item)
            .await
            .map_err(|_| QueueError::Closed)?;
        self.delete_len.fetch_add(1, Relaxed);
        Ok(())
    }

    async fn pop_leave(&self, cancel: &CancellationToken) -> Option<LeaveRequest> {
        let mut rx = self.leave_rx.lock().await;
        tokio::select! {
            item = rx.recv() => {
                if item.is_some() {
                    self.leave_len.fetch_sub(1, Relaxed);
                }
                item
            }
            _ = cancel.cancelled() => None,
        }
    }

    async fn pop_delete(&self, cancel: &CancellationToken, _postpone: Duration) -> DeletePop {
        let mut rx = self.delete_rx.lock().await;
        tokio::select! {
            item = rx.recv() => match item {
                Some(pending) => {
                    self.delete_len.fetch_sub(1, Relaxed);
                    DeletePop::Item(pending)
                }
                None => DeletePop::Idle,
            },
            _ = cancel.cancelled() => DeletePop::Idle,
        }
    }

    async fn push_error(&self, room: &RoomId) {
        // No durable error sink without a persistent backend.
        debug!("No error sink configured, dropping failed room {}", room);
    }

    async fn depths(&self) -> QueueDepths {
        QueueDepths {
            leave: self.leave_len.load(Relaxed),
            delete: self.delete_len.load(Relaxed),
            error: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leave_roundtrip_preserves_order_and_content() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let first = LeaveRequest {
            room_id: RoomId::new("!a:hs"),
            kick: vec![UserId::new("@_x_tg_1:hs"), UserId::new("@_x_tg_2:hs")],
        };
        let second = LeaveRequest {
            room_id: RoomId::new("!b:hs"),
            kick: vec![],
        };
        backend.push_leave(first.clone()).await.unwrap();
        backend.push_leave(second.clone()).await.unwrap();

        assert_eq!(backend.pop_leave(&cancel).await, Some(first));
        assert_eq!(backend.pop_leave(&cancel).await, Some(second));
        assert_eq!(backend.depths().await.leave, 0);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_cancellation() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let popped = tokio::time::timeout(
            Duration::from_secs(1),
            backend.pop_leave(&cancel),
        )
        .await
        .expect("pop should return promptly once cancelled");
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_delete_pop_ignores_postponement_in_memory() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        backend
            .push_delete(PendingRoom::now(RoomId::new("!a:hs")))
            .await
            .unwrap();
        let popped = backend
            .pop_delete(&cancel, Duration::from_secs(86400))
            .await;
        assert!(matches!(popped, DeletePop::Item(p) if p.room_id == RoomId::new("!a:hs")));
    }
}
