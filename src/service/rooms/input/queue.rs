// =============================================================================
// Matrixon Room Server - Per-Room Input Queues
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Serializes admissions per room. Each room gets a worker task fed by a
//   bounded channel; idle workers stop and are started again on demand.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc, time::Duration};

use matrixon_common::{MatrixonError, Result};
use matrixon_core::InputRoomEvent;
use ruma::OwnedRoomId;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::Inputer;

struct Job {
    ctx: CancellationToken,
    input: InputRoomEvent,
    reply: oneshot::Sender<Result<()>>,
}

/// One serial worker per room. Admissions for a room run strictly one after
/// another; different rooms proceed in parallel.
pub struct RoomQueues {
    inputer: Arc<Inputer>,
    capacity: usize,
    idle: Duration,
    roomid_queue: RwLock<HashMap<OwnedRoomId, mpsc::Sender<Job>>>,
}

impl RoomQueues {
    pub fn new(inputer: Arc<Inputer>, capacity: usize, idle: Duration) -> Self {
        Self {
            inputer,
            capacity: capacity.max(1),
            idle,
            roomid_queue: RwLock::new(HashMap::new()),
        }
    }

    /// Queues `input` behind earlier admissions for its room and waits for
    /// its outcome.
    pub async fn input_room_event(
        &self,
        ctx: CancellationToken,
        input: InputRoomEvent,
    ) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(MatrixonError::Cancelled(format!(
                "admission of {} cancelled before queueing",
                input.event.event_id
            )));
        }

        let event_id = input.event.event_id.clone();
        let room_id = input.event.room_id.clone();
        let (reply, outcome) = oneshot::channel();
        let mut job = Job {
            ctx: ctx.clone(),
            input,
            reply,
        };
        loop {
            match self.queue_for(&room_id).await.send(job).await {
                Ok(()) => break,
                // the worker went idle after we picked it up
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(MatrixonError::Cancelled(format!(
                "caller stopped waiting for {event_id}"
            ))),
            result = outcome => result.unwrap_or_else(|_| {
                Err(MatrixonError::Cancelled(format!(
                    "room worker dropped {event_id}"
                )))
            }),
        }
    }

    /// Number of rooms that have a running worker.
    pub async fn room_count(&self) -> usize {
        self.roomid_queue
            .read()
            .await
            .values()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    async fn queue_for(&self, room_id: &OwnedRoomId) -> mpsc::Sender<Job> {
        if let Some(sender) = self.roomid_queue.read().await.get(room_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let mut queues = self.roomid_queue.write().await;
        if let Some(sender) = queues.get(room_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        queues.retain(|_, sender| !sender.is_closed());
        let (sender, receiver) = mpsc::channel(self.capacity);
        let inputer = Arc::clone(&self.inputer);
        tokio::spawn(
            worker(inputer, receiver, self.idle)
                .instrument(tracing::info_span!("room_queue", room_id = %room_id)),
        );
        info!(%room_id, "🏠 Started room input worker");
        queues.insert(room_id.clone(), sender.clone());
        sender
    }
}

async fn worker(inputer: Arc<Inputer>, mut jobs: mpsc::Receiver<Job>, idle: Duration) {
    loop {
        match tokio::time::timeout(idle, jobs.recv()).await {
            Ok(Some(job)) => run_job(&inputer, job).await,
            Ok(None) => break,
            Err(_) => {
                jobs.close();
                // finish whatever was queued before the close
                while let Ok(job) = jobs.try_recv() {
                    run_job(&inputer, job).await;
                }
                debug!(idle_secs = idle.as_secs(), "💤 Room input worker stopped while idle");
                break;
            }
        }
    }
}

async fn run_job(inputer: &Inputer, job: Job) {
    if job.ctx.is_cancelled() || job.reply.is_closed() {
        debug!(event_id = %job.input.event.event_id, "Skipping admission nobody waits for");
        return;
    }
    let result = inputer.process_room_event(&job.ctx, job.input).await;
    if job.reply.send(result).is_err() {
        warn!("Admission finished after the caller went away");
    }
}
