//! Collaborator traits for the room server
//!
//! The admission pipeline talks to storage, authorization, state resolution,
//! federation and downstream consumers only through these traits. Every
//! implementation must be shareable across room workers.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, OwnedServerName, RoomId, RoomVersionId, ServerName};
use serde::{Deserialize, Serialize};

use matrixon_common::Result;

use crate::{
    auth_events::AuthEvents,
    pdu::PduEvent,
    types::{
        EventNid, OutputEvent, RoomInfo, RoomNid, StateAtEvent, StateEntry, StateSnapshotNid,
        StoreEventOutcome, StoredEvent, TransactionId,
    },
};

/// Durable storage for events, state snapshots and room metadata.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stored events among `event_ids`. Unknown IDs are left out.
    async fn events_from_ids(&self, event_ids: &[OwnedEventId]) -> Result<Vec<StoredEvent>>;

    /// Stored events by numeric handle. Unknown handles are left out.
    async fn events(&self, event_nids: &[EventNid]) -> Result<Vec<StoredEvent>>;

    /// Persists `event`, creating the room on its first event.
    ///
    /// Storing an event twice keeps its numeric handle and before-state. A
    /// rejected event stays rejected.
    async fn store_event(
        &self,
        event: Arc<PduEvent>,
        room_version: &RoomVersionId,
        auth_event_nids: &[EventNid],
        is_rejected: bool,
    ) -> Result<StoreEventOutcome>;

    async fn room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>>;

    /// State entries for the given state events. Every ID must be stored.
    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<StateEntry>>;

    /// Contents of a stored snapshot.
    async fn state_entries(&self, snapshot_nid: StateSnapshotNid) -> Result<Vec<StateEntry>>;

    /// Stores a new snapshot. `entries` must not repeat a state key.
    async fn add_state(
        &self,
        room_nid: RoomNid,
        entries: Vec<StateEntry>,
    ) -> Result<StateSnapshotNid>;

    /// Records the state before an event.
    async fn set_state(&self, event_nid: EventNid, snapshot_nid: StateSnapshotNid) -> Result<()>;

    /// State at each stored event among `event_ids`, whether or not its
    /// before-state has been calculated yet.
    async fn state_at_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, StateAtEvent>>;

    /// Member events in the room's current state.
    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> Result<Vec<EventNid>>;

    /// Forward extremities of the room.
    async fn latest_event_ids(&self, room_nid: RoomNid) -> Result<Vec<OwnedEventId>>;

    async fn set_latest_events(
        &self,
        room_nid: RoomNid,
        latest_event_ids: Vec<OwnedEventId>,
        current_state: StateSnapshotNid,
    ) -> Result<()>;
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Allowed,
    Rejected(String),
}

impl AuthVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthVerdict::Allowed)
    }
}

/// The room authorization rules.
///
/// `Err` means the check could not be carried out at all; a refused event
/// is `Ok(AuthVerdict::Rejected(_))`.
pub trait AuthorizationOracle: Send + Sync {
    fn allowed(&self, event: &PduEvent, auth_events: &AuthEvents) -> Result<AuthVerdict>;
}

#[async_trait]
pub trait StateResolver: Send + Sync {
    /// Computes, stores and returns the snapshot before `event`.
    async fn calculate_and_store_state_before_event(
        &self,
        room_info: &RoomInfo,
        event: &PduEvent,
        is_rejected: bool,
    ) -> Result<StateSnapshotNid>;

    /// Computes and stores the snapshot after a set of events.
    async fn calculate_and_store_state_after_events(
        &self,
        room_info: &RoomInfo,
        prev_states: &[StateAtEvent],
    ) -> Result<StateSnapshotNid>;
}

/// Body of a `/get_missing_events` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEventsRequest {
    pub earliest_events: Vec<OwnedEventId>,
    pub latest_events: Vec<OwnedEventId>,
    pub limit: u32,
    pub min_depth: u64,
}

/// Answer of a `/state_ids` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIdsResponse {
    pub pdu_ids: Vec<OwnedEventId>,
    pub auth_chain_ids: Vec<OwnedEventId>,
}

/// Requests the pipeline sends to other homeservers.
#[async_trait]
pub trait FederationGateway: Send + Sync {
    async fn query_joined_host_server_names(
        &self,
        room_id: &RoomId,
        exclude_self: bool,
    ) -> Result<Vec<OwnedServerName>>;

    /// The complete auth chain of `event_id`.
    async fn get_event_auth(
        &self,
        server: &ServerName,
        room_version: &RoomVersionId,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Arc<PduEvent>>>;

    async fn get_missing_events(
        &self,
        server: &ServerName,
        room_id: &RoomId,
        request: MissingEventsRequest,
    ) -> Result<Vec<Arc<PduEvent>>>;

    async fn get_room_state_ids(
        &self,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIdsResponse>;

    async fn get_event(
        &self,
        server: &ServerName,
        room_version: &RoomVersionId,
        event_id: &EventId,
    ) -> Result<Arc<PduEvent>>;
}

#[async_trait]
pub trait KeyRing: Send + Sync {
    /// Fails with `MatrixonError::Signature` when the event is not correctly signed.
    async fn verify_event_signatures(
        &self,
        event: &PduEvent,
        room_version: &RoomVersionId,
    ) -> Result<()>;
}

/// Input for moving the live edge of a room forward.
#[derive(Debug, Clone)]
pub struct LatestEventsRequest {
    pub room_info: RoomInfo,
    pub state_at_event: StateAtEvent,
    pub event: Arc<PduEvent>,
    pub send_as_server: Option<OwnedServerName>,
    pub transaction_id: Option<TransactionId>,
    pub rewrites_state: bool,
}

#[async_trait]
pub trait LatestEventsUpdater: Send + Sync {
    async fn update_latest_events(&self, request: LatestEventsRequest) -> Result<()>;
}

#[async_trait]
pub trait OutputNotifier: Send + Sync {
    async fn publish(&self, room_id: &RoomId, events: Vec<OutputEvent>) -> Result<()>;
}
