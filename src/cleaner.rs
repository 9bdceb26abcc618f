#![forbid(unsafe_code)]

// Bulk cleanup worker pool and queue admission.

use crate::ids::RoomId;
use crate::queue::Queues;
use crate::roomlist::{self, RoomListError};
use crate::rules::{self, Caller};
use crate::synapse::AdminClient;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-request room counts, written concurrently by the worker pool.
#[derive(Default)]
struct Tally {
    removed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct TallyCounts {
    pub removed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl Tally {
    fn snapshot(&self) -> TallyCounts {
        TallyCounts {
            removed: self.removed.load(Relaxed),
            skipped: self.skipped.load(Relaxed),
            failed: self.failed.load(Relaxed),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanError {
    #[error("cleanup was cancelled before all rooms were dispatched")]
    Cancelled,
}

/// Result of a bulk clean: the tally always reflects the rooms actually
/// processed, even when the run was cut short.
#[derive(Debug)]
pub struct CleanOutcome {
    pub tally: TallyCounts,
    pub error: Option<CleanError>,
}

/// Per-room admission results for an explicit queue request.
#[derive(Debug, Default, Serialize)]
pub struct AdmissionReport {
    pub queued: Vec<RoomId>,
    pub rejected: Vec<RoomId>,
    pub failed: Vec<RoomId>,
}

#[derive(Clone)]
pub struct Cleaner {
    pub admin: Arc<AdminClient>,
    pub queues: Queues,
    pub db: Option<PgPool>,
    pub worker_count: usize,
}

impl Cleaner {
    /// Enumerate every room the caller owns and fan them out over the worker
    /// pool. Each authorized room is pushed onto the leave queue; the
    /// background loops take it from there.
    pub async fn clean_all(
        &self,
        caller: &Caller,
        cancel: &CancellationToken,
    ) -> Result<CleanOutcome, RoomListError> {
        info!("{} requested a room cleanup", caller.bot.user_id);
        let rooms = roomlist::owned_rooms(caller, self.db.as_ref()).await?;
        debug!("Found {} rooms", rooms.len());

        let tally = Arc::new(Tally::default());
        let (tx, rx) = mpsc::channel::<RoomId>(self.worker_count);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            workers.push(tokio::spawn(clean_worker(
                self.clone(),
                caller.clone(),
                rx.clone(),
                tally.clone(),
            )));
        }

        let mut cancelled = false;
        for room in rooms {
            tokio::select! {
                sent = tx.send(room) => {
                    if sent.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => {
                    warn!(
                        "Room cleanup for {} was cancelled before it completed",
                        caller.bot.user_id
                    );
                    cancelled = true;
                    break;
                }
            }
        }
        drop(tx);

        // Already-dispatched rooms are allowed to finish.
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Cleanup worker task failed: {}", e);
            }
        }

        let tally = tally.snapshot();
        if cancelled {
            return Ok(CleanOutcome {
                tally,
                error: Some(CleanError::Cancelled),
            });
        }
        info!(
            "Room cleanup for {} completed: {:?}",
            caller.bot.user_id, tally
        );
        Ok(CleanOutcome { tally, error: None })
    }

    /// Authorize each requested room independently and push the eligible ones
    /// onto the leave queue. One room's failure never blocks the others.
    pub async fn queue_rooms(&self, caller: &Caller, rooms: Vec<RoomId>) -> AdmissionReport {
        let mut report = AdmissionReport::default();
        for room in rooms {
            match rules::authorize_room(&caller.bot, &caller.client, &self.admin, &room).await {
                Ok(kick) => match self.queues.push_leave(room.clone(), kick).await {
                    Ok(()) => {
                        debug!("Queued {} for cleanup", room);
                        report.queued.push(room);
                    }
                    Err(e) => {
                        warn!("Failed to queue {} for cleanup: {}", room, e);
                        report.failed.push(room);
                    }
                },
                Err(e) if e.is_remote() => {
                    warn!("Failed to check {}: {}", room, e);
                    report.failed.push(room);
                }
                Err(e) => {
                    debug!("Rejected {}: {}", room, e);
                    report.rejected.push(room);
                }
            }
        }
        report
    }
}

/// One pool worker: processes rooms from the shared channel until it closes.
/// Every fault is attributed to the room that caused it.
async fn clean_worker(
    cleaner: Cleaner,
    caller: Caller,
    rx: Arc<Mutex<mpsc::Receiver<RoomId>>>,
    tally: Arc<Tally>,
) {
    loop {
        let room = { rx.lock().await.recv().await };
        let Some(room) = room else { break };
        match rules::authorize_room(&caller.bot, &caller.client, &cleaner.admin, &room).await {
            Ok(kick) => match cleaner.queues.push_leave(room.clone(), kick).await {
                Ok(()) => {
                    debug!("Queued {} for cleanup", room);
                    tally.removed.fetch_add(1, Relaxed);
                }
                Err(e) => {
                    warn!("Failed to queue {} for cleanup: {}", room, e);
                    tally.failed.fetch_add(1, Relaxed);
                }
            },
            Err(e) if e.is_remote() => {
                warn!("Failed to clean up {}: {}", room, e);
                tally.failed.fetch_add(1, Relaxed);
            }
            Err(e) => {
                debug!("Skipping room {} as cleaning is not allowed: {}", room, e);
                tally.skipped.fetch_add(1, Relaxed);
            }
        }
    }
}
