#![forbid(unsafe_code)]

// Redis queue backend — three independent lists that survive restarts.

use super::{
    DeletePop, LeaveRequest, PendingRoom, QueueBackend, QueueDepths, QueueError, StoredPending,
};
use crate::ids::RoomId;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const LEAVE_QUEUE_KEY: &str = "sweepserv:leave_queue";
const DELETE_QUEUE_KEY: &str = "sweepserv:delete_queue";
const ERROR_QUEUE_KEY: &str = "sweepserv:error_queue";

/// How long an empty-queue pop sleeps before checking again.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RedisBackend {
    conn: ConnectionManager,
    leave_key: String,
    delete_key: String,
    error_key: String,
}

fn queue_key(base: &str, dry_run: bool) -> String {
    if dry_run {
        // Keeps dry runs from draining or polluting the real queues.
        base.replacen(':', ":dry_run:", 1)
    } else {
        base.to_string()
    }
}

impl RedisBackend {
    pub async fn connect(url: &str, dry_run: bool) -> Result<Self, QueueError> {
        debug!("Initializing redis client");
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let backend = Self {
            conn,
            leave_key: queue_key(LEAVE_QUEUE_KEY, dry_run),
            delete_key: queue_key(DELETE_QUEUE_KEY, dry_run),
            error_key: queue_key(ERROR_QUEUE_KEY, dry_run),
        };
        debug!(
            "Redis queue keys: {}, {}, {}",
            backend.leave_key, backend.delete_key, backend.error_key
        );
        Ok(backend)
    }

    async fn list_len(&self, key: &str) -> u64 {
        let mut conn = self.conn.clone();
        match conn.llen::<_, u64>(key).await {
            Ok(len) => len,
            Err(e) => {
                warn!("Failed to read length of {}: {}", key, e);
                0
            }
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push_leave(&self, item: LeaveRequest) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&item)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.leave_key, payload).await?;
        Ok(())
    }

    async fn push_delete(&self, item: PendingRoom) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&item)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.delete_key, payload).await?;
        Ok(())
    }

    async fn pop_leave(&self, cancel: &CancellationToken) -> Option<LeaveRequest> {
        loop {
            let mut conn = self.conn.clone();
            match conn.lpop::<_, Option<String>>(&self.leave_key, None).await {
                Ok(Some(payload)) => match serde_json::from_str::<LeaveRequest>(&payload) {
                    Ok(item) => return Some(item),
                    Err(e) => {
                        error!("Failed to decode leave queue item {:?}: {}", payload, e);
                        continue;
                    }
                },
                Ok(None) => {}
                Err(e) => error!("Failed to pop next leave item from redis: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn pop_delete(&self, _cancel: &CancellationToken, postpone: Duration) -> DeletePop {
        let mut conn = self.conn.clone();

        // Peek before removing: the head stays in place until its dwell time
        // has elapsed. Nothing pushes to the head, so the subsequent pop
        // takes the same item.
        let head = match conn
            .lrange::<_, Vec<String>>(&self.delete_key, 0, 0)
            .await
        {
            Ok(items) => match items.into_iter().next() {
                Some(payload) => payload,
                None => return DeletePop::Idle,
            },
            Err(e) => {
                error!("Failed to peek next delete item from redis: {}", e);
                return DeletePop::Idle;
            }
        };
        let stored = StoredPending::decode(&head);
        if !stored.is_due(postpone, SystemTime::now()) {
            debug!(
                "Next delete queue item {} is not due yet",
                stored.room_id()
            );
            return DeletePop::NotReady;
        }

        match conn.lpop::<_, Option<String>>(&self.delete_key, None).await {
            Ok(Some(payload)) => match StoredPending::decode(&payload) {
                StoredPending::Timed(pending) => DeletePop::Item(pending),
                StoredPending::Legacy(room_id) => DeletePop::Item(PendingRoom {
                    room_id,
                    queued_at: SystemTime::UNIX_EPOCH,
                }),
            },
            Ok(None) => DeletePop::Idle,
            Err(e) => {
                error!("Failed to pop next delete item from redis: {}", e);
                DeletePop::Idle
            }
        }
    }

    async fn push_error(&self, room: &RoomId) {
        debug!("Marking {} as errored in redis", room);
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .rpush::<_, _, ()>(&self.error_key, room.as_str())
            .await
        {
            error!("Failed to mark {} as errored in redis: {}", room, e);
        }
    }

    async fn depths(&self) -> QueueDepths {
        QueueDepths {
            leave: self.list_len(&self.leave_key).await,
            delete: self.list_len(&self.delete_key).await,
            error: self.list_len(&self.error_key).await,
        }
    }
}
