// =============================================================================
// Matrixon Room Server - Room Head Updater
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Moves the live edge of a room forward when a new event is admitted:
//   recomputes the forward extremities and the current state, stores both
//   and announces the event downstream.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use matrixon_common::Result;
use matrixon_core::{
    EventStore, LatestEventsRequest, LatestEventsUpdater, OutputEvent, OutputNewRoomEvent,
    OutputNotifier, RoomNid, StateAtEvent, StateResolver, StateSnapshotNid,
};
use ruma::OwnedEventId;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub struct RoomHeadUpdater {
    db: Arc<dyn EventStore>,
    resolver: Arc<dyn StateResolver>,
    output: Arc<dyn OutputNotifier>,
    roomnid_mutex_head: RwLock<HashMap<RoomNid, Arc<Mutex<()>>>>,
}

impl RoomHeadUpdater {
    pub fn new(
        db: Arc<dyn EventStore>,
        resolver: Arc<dyn StateResolver>,
        output: Arc<dyn OutputNotifier>,
    ) -> Self {
        Self {
            db,
            resolver,
            output,
            roomnid_mutex_head: RwLock::new(HashMap::new()),
        }
    }

    /// Extremities after `event` lands: the old ones it does not reference,
    /// plus the event itself.
    fn next_extremities(
        old: Vec<OwnedEventId>,
        prev_events: &[OwnedEventId],
        event_id: &OwnedEventId,
    ) -> Vec<OwnedEventId> {
        let mut latest: Vec<OwnedEventId> = old
            .into_iter()
            .filter(|id| !prev_events.contains(id) && id != event_id)
            .collect();
        latest.push(event_id.clone());
        latest
    }

    async fn current_state(
        &self,
        request: &LatestEventsRequest,
        latest: &[OwnedEventId],
    ) -> Result<StateSnapshotNid> {
        let by_id = self.db.state_at_event_ids(latest).await?;
        let mut states: Vec<StateAtEvent> = Vec::with_capacity(latest.len());
        for id in latest {
            if *id == request.event.event_id {
                states.push(request.state_at_event.clone());
                continue;
            }
            match by_id.get(id) {
                Some(state) if state.before_state_snapshot_nid.is_set() => {
                    states.push(state.clone())
                }
                _ => warn!(extremity = %id, "Forward extremity has no known state, leaving it out"),
            }
        }
        self.resolver
            .calculate_and_store_state_after_events(&request.room_info, &states)
            .await
    }

    async fn advance_head(&self, request: LatestEventsRequest) -> Result<()> {
        let room_nid = request.room_info.room_nid;
        // only a wholesale state overwrite forgets the old extremities
        let overwrite = request.state_at_event.overwrite;
        let latest = if overwrite {
            vec![request.event.event_id.clone()]
        } else {
            let old = self.db.latest_event_ids(room_nid).await?;
            Self::next_extremities(old, &request.event.prev_events, &request.event.event_id)
        };
        let current_state = self.current_state(&request, &latest).await?;

        debug!(
            extremities = latest.len(),
            %current_state,
            overwrite,
            rewrites_state = request.rewrites_state,
            "Updating room head"
        );
        self.db
            .set_latest_events(room_nid, latest.clone(), current_state)
            .await?;

        self.output
            .publish(
                &request.event.room_id,
                vec![OutputEvent::NewRoomEvent(OutputNewRoomEvent {
                    event: Arc::clone(&request.event),
                    latest_event_ids: latest,
                    // an overwritten room was learnt from elsewhere, nothing to send
                    send_as_server: if overwrite { None } else { request.send_as_server },
                    transaction_id: request.transaction_id,
                    rewrites_state: request.rewrites_state,
                })],
            )
            .await?;

        info!("✅ Room head moved forward");
        Ok(())
    }
}

#[async_trait]
impl LatestEventsUpdater for RoomHeadUpdater {
    #[tracing::instrument(skip_all, fields(event_id = %request.event.event_id, room_id = %request.event.room_id))]
    async fn update_latest_events(&self, request: LatestEventsRequest) -> Result<()> {
        let room_nid = request.room_info.room_nid;
        let mutex_head = Arc::clone(
            self.roomnid_mutex_head
                .write()
                .await
                .entry(room_nid)
                .or_default(),
        );
        let result = {
            let _head_lock = mutex_head.lock().await;
            self.advance_head(request).await
        };

        let mut heads = self.roomnid_mutex_head.write().await;
        // nobody else holds or waits on this room's lock
        if Arc::strong_count(&mutex_head) == 2 {
            heads.remove(&room_nid);
        }
        result
    }
}
