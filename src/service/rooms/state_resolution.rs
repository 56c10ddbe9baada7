// =============================================================================
// Matrixon Room Server - Prev Events State Resolver
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Reference state resolver. The state before an event is the merge of the
//   states after each of its prev events; conflicting slots go to the most
//   recently stored event.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use matrixon_common::{MatrixonError, Result};
use matrixon_core::{
    EventNid, EventStore, PduEvent, RoomInfo, StateAtEvent, StateEntry, StateKeyTuple,
    StateResolver, StateSnapshotNid,
};
use tracing::debug;

pub struct PrevEventsStateResolver {
    db: Arc<dyn EventStore>,
}

impl PrevEventsStateResolver {
    pub fn new(db: Arc<dyn EventStore>) -> Self {
        Self { db }
    }

    /// The state after `state`: its before-state plus its own slot.
    async fn state_after(&self, state: &StateAtEvent) -> Result<Vec<StateEntry>> {
        let mut entries = self.db.state_entries(state.before_state_snapshot_nid).await?;
        if !state.is_rejected {
            if let Some(own) = state.state_entry() {
                entries.push(own);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl StateResolver for PrevEventsStateResolver {
    async fn calculate_and_store_state_before_event(
        &self,
        room_info: &RoomInfo,
        event: &PduEvent,
        _is_rejected: bool,
    ) -> Result<StateSnapshotNid> {
        let by_id = self.db.state_at_event_ids(&event.prev_events).await?;
        let mut prev_states = Vec::with_capacity(event.prev_events.len());
        for prev in &event.prev_events {
            match by_id.get(prev) {
                Some(state) if state.before_state_snapshot_nid.is_set() => {
                    prev_states.push(state.clone())
                }
                _ => {
                    return Err(MatrixonError::MissingPrevEvents {
                        event_id: event.event_id.clone(),
                        reason: format!("no state known at prev event {prev}"),
                    })
                }
            }
        }
        self.calculate_and_store_state_after_events(room_info, &prev_states)
            .await
    }

    async fn calculate_and_store_state_after_events(
        &self,
        room_info: &RoomInfo,
        prev_states: &[StateAtEvent],
    ) -> Result<StateSnapshotNid> {
        if let [single] = prev_states {
            // a timeline event leaves the state untouched
            if (!single.is_state_event() || single.is_rejected)
                && single.before_state_snapshot_nid.is_set()
            {
                return Ok(single.before_state_snapshot_nid);
            }
        }

        let mut merged: BTreeMap<StateKeyTuple, EventNid> = BTreeMap::new();
        for state in prev_states {
            for entry in self.state_after(state).await? {
                merged
                    .entry(entry.key)
                    .and_modify(|nid| *nid = (*nid).max(entry.event_nid))
                    .or_insert(entry.event_nid);
            }
        }

        let entries: Vec<StateEntry> = merged
            .into_iter()
            .map(|(key, nid)| StateEntry::new(key, nid))
            .collect();
        debug!(
            room_nid = %room_info.room_nid,
            prev_count = prev_states.len(),
            entries = entries.len(),
            "Merged prev event states"
        );
        self.db.add_state(room_info.room_nid, entries).await
    }
}
