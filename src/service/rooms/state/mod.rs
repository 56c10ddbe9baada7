// =============================================================================
// Matrixon Room Server - State Calculation
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Works out and records the state before a newly persisted event, either
//   from state IDs supplied with the event or through the state resolver.
//
// =============================================================================

use matrixon_common::Result;
use matrixon_core::{
    deduplicate_state_entries, InputRoomEvent, PduEvent, RoomInfo, StateAtEvent,
};
use tracing::{debug, warn};

use crate::service::Collaborators;

pub struct Service {
    services: Collaborators,
}

impl Service {
    pub fn new(services: Collaborators) -> Self {
        Self { services }
    }

    /// Computes the before-state of `event` and binds it to the event's NID.
    ///
    /// Returns `state_at_event` with the new snapshot handle and overwrite
    /// flag filled in.
    #[tracing::instrument(skip_all, fields(event_id = %event.event_id, has_state = input.has_state))]
    pub async fn calculate_and_set_state(
        &self,
        input: &InputRoomEvent,
        room_info: &RoomInfo,
        mut state_at_event: StateAtEvent,
        event: &PduEvent,
        is_rejected: bool,
    ) -> Result<StateAtEvent> {
        if input.has_state && !is_rejected {
            // Replace the room state wholesale unless a local user is joined,
            // in which case the supplied state is merged instead.
            state_at_event.overwrite = true;
            match self
                .services
                .db
                .get_membership_event_nids_for_room(room_info.room_nid, true, true)
                .await
            {
                Ok(joined) => state_at_event.overwrite = joined.is_empty(),
                Err(e) => {
                    warn!(error = %e, "Failed to query local joined members, overwriting state");
                }
            }

            let entries = self
                .services
                .db
                .state_entries_for_event_ids(&input.state_event_ids)
                .await?;
            let entries = deduplicate_state_entries(entries);
            debug!(
                entries = entries.len(),
                overwrite = state_at_event.overwrite,
                "📸 Storing supplied state"
            );
            state_at_event.before_state_snapshot_nid = self
                .services
                .db
                .add_state(room_info.room_nid, entries)
                .await?;
        } else {
            state_at_event.overwrite = false;
            state_at_event.before_state_snapshot_nid = self
                .services
                .resolver
                .calculate_and_store_state_before_event(room_info, event, is_rejected)
                .await?;
        }

        self.services
            .db
            .set_state(state_at_event.event_nid, state_at_event.before_state_snapshot_nid)
            .await?;
        Ok(state_at_event)
    }
}
