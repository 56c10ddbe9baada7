// =============================================================================
// Matrixon Room Server - Missing State Fetcher
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Fills the gap between a room's forward extremities and an incoming event
//   whose prev events are unknown. Missing events are fetched from other
//   servers and, when even the oldest of them lacks state, the state before
//   it is fetched and admitted as outliers first.
//
// =============================================================================

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use matrixon_common::{MatrixonError, Result};
use matrixon_core::{
    InputKind, InputRoomEvent, MissingEventsRequest, PduEvent, StateIdsResponse,
};
use ruma::{OwnedEventId, OwnedServerName, RoomVersionId};
use tracing::{debug, info, warn};

use crate::{
    metrics,
    service::rooms::{
        input::Inputer,
        topology::{reverse_topological_ordering, TopologicalOrder},
    },
};

/// Gap filling for a single incoming event.
pub struct MissingStateFetcher<'a> {
    inputer: &'a Inputer,
    room_version: RoomVersionId,
    servers: Vec<OwnedServerName>,
    /// Server that answered `/get_missing_events`
    origin: Option<OwnedServerName>,
    /// Event IDs already requested or resolved
    had_events: HashSet<OwnedEventId>,
    /// Fetched events not persisted yet
    have_events: HashMap<OwnedEventId, Arc<PduEvent>>,
    failed_servers: HashSet<OwnedServerName>,
}

impl<'a> MissingStateFetcher<'a> {
    pub fn new(
        inputer: &'a Inputer,
        room_version: RoomVersionId,
        servers: Vec<OwnedServerName>,
    ) -> Self {
        Self {
            inputer,
            room_version,
            servers,
            origin: None,
            had_events: HashSet::new(),
            have_events: HashMap::new(),
            failed_servers: HashSet::new(),
        }
    }

    /// Makes the prev events of `event` known locally.
    ///
    /// Returns the state before `event` when it turned out to be the oldest
    /// event of the gap itself; the caller then stores that state with it.
    #[tracing::instrument(skip_all, fields(event_id = %event.event_id, room_id = %event.room_id))]
    pub async fn process_event_with_missing_state(
        mut self,
        event: &Arc<PduEvent>,
    ) -> Result<Option<Vec<OwnedEventId>>> {
        let result = self.fill_gap(event).await;
        metrics::missing_state_fetched(result.is_ok());
        result
    }

    async fn fill_gap(&mut self, event: &Arc<PduEvent>) -> Result<Option<Vec<OwnedEventId>>> {
        let new_events = self.get_missing_events(event).await?;
        let backwards_extremity = new_events.first().map(Arc::clone).unwrap_or_else(|| Arc::clone(event));
        let is_incoming = backwards_extremity.event_id == event.event_id;
        info!(
            backwards_extremity = %backwards_extremity.event_id,
            fetched = new_events.len() - 1,
            "🔨 Filling gap in room graph"
        );

        let mut supplied_state = None;
        if self.prev_states_known(&backwards_extremity).await? {
            if !is_incoming {
                self.admit(InputKind::Old, Arc::clone(&backwards_extremity), None)
                    .await?;
            }
        } else {
            let state_ids = self.lookup_state_before(&backwards_extremity).await?;
            if is_incoming {
                supplied_state = Some(state_ids);
            } else {
                self.admit(
                    InputKind::Old,
                    Arc::clone(&backwards_extremity),
                    Some(state_ids),
                )
                .await?;
            }
        }

        for newer in new_events
            .iter()
            .skip(1)
            .filter(|e| e.event_id != event.event_id)
        {
            self.admit(InputKind::Old, Arc::clone(newer), None).await?;
        }

        if supplied_state.is_none() && !self.prev_states_known(event).await? {
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: "expected to find missing events but didn't".to_owned(),
            });
        }
        Ok(supplied_state)
    }

    /// Events between the room's forward extremities and `event`, oldest
    /// first, with `event` itself last.
    async fn get_missing_events(&mut self, event: &Arc<PduEvent>) -> Result<Vec<Arc<PduEvent>>> {
        let services = self.inputer.services();
        let latest = match services.db.room_info(&event.room_id).await? {
            Some(info) => services.db.latest_event_ids(info.room_nid).await?,
            None => Vec::new(),
        };
        let request = MissingEventsRequest {
            earliest_events: latest,
            latest_events: vec![event.event_id.clone()],
            limit: self.inputer.config().missing_events_limit,
            min_depth: 0,
        };

        let mut response = None;
        for server in &self.servers {
            if self.failed_servers.contains(server) {
                continue;
            }
            match services
                .federation
                .get_missing_events(server, &event.room_id, request.clone())
                .await
            {
                Ok(events) => {
                    response = Some((server.clone(), events));
                    break;
                }
                Err(e) => {
                    warn!(%server, error = %e, "Failed to get missing events from server");
                    self.failed_servers.insert(server.clone());
                }
            }
        }
        let Some((server, events)) = response else {
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: format!("no servers returned missing events, tried {:?}", self.servers),
            });
        };
        debug!(%server, returned = events.len(), "Got missing events");
        self.origin = Some(server);

        let candidate_ids: Vec<OwnedEventId> = events.iter().map(|e| e.event_id.clone()).collect();
        let stored: HashSet<OwnedEventId> = services
            .db
            .events_from_ids(&candidate_ids)
            .await?
            .into_iter()
            .map(|s| s.event.event_id.clone())
            .collect();

        for fetched in events {
            if fetched.room_id != event.room_id {
                warn!(fetched = %fetched.event_id, room_id = %fetched.room_id, "Missing event belongs to another room, dropping");
                continue;
            }
            if fetched.event_id == event.event_id
                || stored.contains(&fetched.event_id)
                || self.had_events.contains(&fetched.event_id)
            {
                continue;
            }
            if let Err(e) = services
                .key_ring
                .verify_event_signatures(&fetched, &self.room_version)
                .await
            {
                warn!(fetched = %fetched.event_id, error = %e, "Dropping missing event with bad signature");
                continue;
            }
            self.had_events.insert(fetched.event_id.clone());
            self.have_events.insert(fetched.event_id.clone(), fetched);
        }

        let unresolved: Vec<Arc<PduEvent>> = self.have_events.values().cloned().collect();
        let mut ordered = reverse_topological_ordering(&unresolved, TopologicalOrder::ByPrevEvents);
        ordered.push(Arc::clone(event));
        Ok(ordered)
    }

    async fn prev_states_known(&self, event: &PduEvent) -> Result<bool> {
        Ok(self.inputer.missing_prev_events(event).await?.is_empty())
    }

    /// Fetches the state before `event`, persists every unknown piece of it
    /// as an outlier and returns the state event IDs.
    async fn lookup_state_before(&mut self, event: &PduEvent) -> Result<Vec<OwnedEventId>> {
        let services = self.inputer.services();
        let mut response = None;
        for server in &self.servers {
            if self.failed_servers.contains(server) {
                continue;
            }
            match services
                .federation
                .get_room_state_ids(server, &event.room_id, &event.event_id)
                .await
            {
                Ok(state) => {
                    response = Some(state);
                    break;
                }
                Err(e) => {
                    warn!(%server, error = %e, "Failed to get state ids from server");
                    self.failed_servers.insert(server.clone());
                }
            }
        }
        let Some(state) = response else {
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: "no servers provided the state before the gap".to_owned(),
            });
        };

        let state_ids = state.pdu_ids.clone();
        self.admit_state_as_outliers(event, state).await?;
        Ok(state_ids)
    }

    async fn admit_state_as_outliers(
        &mut self,
        event: &PduEvent,
        state: StateIdsResponse,
    ) -> Result<()> {
        let wanted: Vec<OwnedEventId> = state
            .pdu_ids
            .into_iter()
            .chain(state.auth_chain_ids)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let stored: HashSet<OwnedEventId> = self
            .inputer
            .services()
            .db
            .events_from_ids(&wanted)
            .await?
            .into_iter()
            .map(|s| s.event.event_id.clone())
            .collect();

        let mut outliers = Vec::new();
        for id in wanted {
            if stored.contains(&id) {
                continue;
            }
            if let Some(have) = self.have_events.get(&id) {
                outliers.push(Arc::clone(have));
                continue;
            }
            outliers.push(self.fetch_event(event, &id).await?);
            self.had_events.insert(id);
        }
        debug!(outliers = outliers.len(), "💾 Persisting state before gap");

        for outlier in reverse_topological_ordering(&outliers, TopologicalOrder::ByAuthEvents) {
            self.admit(InputKind::Outlier, outlier, None).await?;
        }
        Ok(())
    }

    /// Fetches one event by ID from the first server able to provide a
    /// verified copy.
    async fn fetch_event(&self, gap_event: &PduEvent, event_id: &OwnedEventId) -> Result<Arc<PduEvent>> {
        let services = self.inputer.services();
        for server in &self.servers {
            if self.failed_servers.contains(server) {
                continue;
            }
            let fetched = match services
                .federation
                .get_event(server, &self.room_version, event_id)
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(%server, %event_id, error = %e, "Failed to get event from server");
                    continue;
                }
            };
            if fetched.event_id != *event_id || fetched.room_id != gap_event.room_id {
                warn!(%server, %event_id, "Server returned a different event");
                continue;
            }
            match services
                .key_ring
                .verify_event_signatures(&fetched, &self.room_version)
                .await
            {
                Ok(()) => return Ok(fetched),
                Err(e) => warn!(%server, %event_id, error = %e, "Fetched event has bad signature"),
            }
        }
        Err(MatrixonError::MissingPrevEvents {
            event_id: gap_event.event_id.clone(),
            reason: format!("no servers provided state event {event_id}"),
        })
    }

    async fn admit(
        &mut self,
        kind: InputKind,
        event: Arc<PduEvent>,
        state: Option<Vec<OwnedEventId>>,
    ) -> Result<()> {
        let event_id = event.event_id.clone();
        let mut input = InputRoomEvent::new(kind, event, self.room_version.clone());
        if let Some(origin) = &self.origin {
            input = input.with_origin(origin.clone());
        }
        if let Some(state) = state {
            input = input.with_state(state);
        }

        let result = self.inputer.admit(input).await;
        self.have_events.remove(&event_id);
        match result {
            Err(e) if e.is_rejection() => {
                warn!(%event_id, error = %e, "Gap event rejected");
                Ok(())
            }
            other => other,
        }
    }
}
