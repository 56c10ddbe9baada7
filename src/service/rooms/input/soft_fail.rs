// =============================================================================
// Matrixon Room Server - Soft-Fail Check
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Re-checks an authorized event against the room's current state so that
//   events from users who have since lost access do not reach the head.
//
// =============================================================================

use matrixon_common::Result;
use matrixon_core::{
    auth_types_for_event, deduplicate_state_entries, AuthEvents, EventNid, InputRoomEvent,
    PduEvent,
};
use tracing::debug;

use crate::service::Collaborators;

/// Whether `event` would be refused by the room's current state, or by the
/// supplied state when the input carries one.
///
/// A room without any state yet never soft-fails an event.
pub async fn check_for_soft_fail(
    services: &Collaborators,
    input: &InputRoomEvent,
    event: &PduEvent,
) -> Result<bool> {
    let entries = if input.has_state {
        deduplicate_state_entries(
            services
                .db
                .state_entries_for_event_ids(&input.state_event_ids)
                .await?,
        )
    } else {
        let Some(room_info) = services.db.room_info(&event.room_id).await? else {
            return Ok(false);
        };
        if room_info.is_stub {
            return Ok(false);
        }
        services.db.state_entries(room_info.state_snapshot_nid).await?
    };

    if entries.is_empty() {
        return Ok(false);
    }

    let needed = auth_types_for_event(event);
    let nids: Vec<EventNid> = entries
        .iter()
        .filter(|entry| needed.contains(&entry.key))
        .map(|entry| entry.event_nid)
        .collect();

    let mut auth = AuthEvents::new();
    for stored in services.db.events(&nids).await? {
        if !stored.rejected {
            auth.add_event(stored.event)?;
        }
    }

    let verdict = services.oracle.allowed(event, &auth)?;
    debug!(event_id = %event.event_id, allowed = verdict.is_allowed(), auth_events = auth.len(), "Checked against current state");
    Ok(!verdict.is_allowed())
}
