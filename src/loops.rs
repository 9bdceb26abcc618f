#![forbid(unsafe_code)]

// Background loop drivers consuming the two queue stages.

use crate::metrics::ServiceMetrics;
use crate::queue::{DeletePop, Queues};
use crate::router::RouterClient;
use crate::sessions::SessionCache;
use crate::synapse::{AdminClient, ApiError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff applied only when the leave queue turned out to be empty.
const LEAVE_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the loop drivers need, cheap to clone into tasks.
#[derive(Clone)]
pub struct LoopContext {
    pub admin: Arc<AdminClient>,
    pub sessions: Arc<SessionCache>,
    pub queues: Queues,
    pub router: Option<Arc<RouterClient>>,
    pub metrics: ServiceMetrics,
    pub postpone: Duration,
    pub queue_sleep: Duration,
    pub dry_run: bool,
}

/// Race a remote call against the shutdown signal.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
    }
}

/// Consume the leave queue as fast as it fills, backing off only when empty.
pub async fn leave_loop(ctx: LoopContext, cancel: CancellationToken) {
    loop {
        let progressed = consume_leave(&ctx, &cancel).await;
        let wait = if progressed {
            Duration::ZERO
        } else {
            LEAVE_BACKOFF
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => break,
        }
    }
    info!("Queue leave loop exiting");
}

/// Process one leave item: evict every listed user, remove the room's
/// aliases, then promote the room to the delete stage. Any failure past the
/// evictions re-queues the original item. Returns whether progress was made.
pub async fn consume_leave(ctx: &LoopContext, cancel: &CancellationToken) -> bool {
    let Some(item) = ctx.queues.pop_leave(cancel).await else {
        return false;
    };
    debug!("Processing leave queue item for {}", item.room_id);
    let start = Instant::now();

    // Individual eviction failures are tolerated; the admin-side deletion
    // kicks any stragglers later.
    for user in &item.kick {
        match with_cancel(cancel, ctx.sessions.get(user)).await {
            Err(e) => warn!("Failed to log in as {} to leave {}: {}", user, item.room_id, e),
            Ok(client) => {
                if ctx.dry_run {
                    debug!("Not leaving {} as {} (dry run)", item.room_id, user);
                } else if let Err(e) = with_cancel(cancel, client.leave_room(&item.room_id)).await {
                    warn!("Failed to leave {} as {}: {}", item.room_id, user, e);
                } else {
                    debug!("Successfully left {} as {}", item.room_id, user);
                }
            }
        }
    }

    let mut failure: Option<String> = None;
    match with_cancel(cancel, ctx.admin.room_aliases(&item.room_id)).await {
        Ok(aliases) => {
            for alias in aliases {
                match with_cancel(cancel, ctx.admin.delete_alias(&alias)).await {
                    Ok(()) => debug!("Removed alias {} of {}", alias, item.room_id),
                    Err(e) => warn!("Failed to remove alias {} of {}: {}", alias, item.room_id, e),
                }
            }
        }
        Err(e) => failure = Some(format!("failed to get aliases: {e}")),
    }

    if failure.is_none() {
        if let Err(e) = ctx.queues.push_delete(item.room_id.clone()).await {
            failure = Some(format!("failed to push to delete queue: {e}"));
        }
    }

    match failure {
        Some(reason) => {
            warn!("Could not finish leaving {}: {}", item.room_id, reason);
            if let Err(e) = ctx
                .queues
                .push_leave(item.room_id.clone(), item.kick.clone())
                .await
            {
                error!("Failed to put {} back on the leave queue: {}", item.room_id, e);
            }
            false
        }
        None => {
            let elapsed = start.elapsed();
            debug!(
                "Room {} successfully left in {:?} and moved to the delete queue",
                item.room_id, elapsed
            );
            ctx.metrics.inc_leaves();
            ctx.metrics.observe_leave(elapsed);
            true
        }
    }
}

/// Consume the delete queue on a fixed cadence — deletion is rate-sensitive
/// on the homeserver side.
pub async fn delete_loop(ctx: LoopContext, cancel: CancellationToken) {
    loop {
        consume_delete(&ctx, &cancel).await;
        tokio::select! {
            _ = tokio::time::sleep(ctx.queue_sleep) => {}
            _ = cancel.cancelled() => break,
        }
    }
    info!("Queue delete loop exiting");
}

/// Process at most one due delete item. Cancellation re-queues the item;
/// any other failure diverts the room to the error sink.
pub async fn consume_delete(ctx: &LoopContext, cancel: &CancellationToken) {
    let pending = match ctx.queues.pop_delete(cancel, ctx.postpone).await {
        DeletePop::Item(pending) => pending,
        DeletePop::NotReady | DeletePop::Idle => return,
    };
    let room = pending.room_id;
    debug!("Requesting deletion of room {}", room);
    let start = Instant::now();

    if let Some(router) = &ctx.router {
        if let Err(e) = with_cancel(cancel, router.forget_room(&room)).await {
            warn!("Failed to ask the router to forget {}: {}", room, e);
        }
    }

    match with_cancel(cancel, ctx.admin.delete_room(&room, true)).await {
        Ok(resp) => {
            let elapsed = start.elapsed();
            debug!(
                "Room {} successfully cleaned up in {:?} ({} users kicked)",
                room,
                elapsed,
                resp.kicked_users.len()
            );
            ctx.metrics.inc_deletes();
            ctx.metrics.observe_delete(elapsed);
        }
        Err(e) if e.is_cancelled() => {
            debug!("Cancelled while cleaning up {}, putting it back in the queue", room);
            if let Err(e) = ctx.queues.push_delete(room.clone()).await {
                error!("Failed to put {} back in the delete queue: {}", room, e);
            }
        }
        Err(e) => {
            warn!("Failed to clean up {}: {}", room, e);
            ctx.queues.push_error(&room).await;
        }
    }
}
