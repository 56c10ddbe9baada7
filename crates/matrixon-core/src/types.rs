//! Core types for the Matrixon room server
//!
//! Numeric handles (`EventNid`, `RoomNid`, `StateSnapshotNid`) are assigned by
//! the event store only once an entity is durably known. Nothing in the
//! admission pipeline holds a numeric handle for an event that has not been
//! persisted yet; such events are tracked by event ID instead.

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{OwnedEventId, OwnedServerName, RoomVersionId};
use serde::{Deserialize, Serialize};

use crate::pdu::PduEvent;

/// Local numeric handle of a persisted event. Never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventNid(pub u64);

/// Local numeric handle of a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomNid(pub u64);

/// Handle of a stored state snapshot. Zero means "not calculated yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateSnapshotNid(pub u64);

impl StateSnapshotNid {
    pub const UNSET: StateSnapshotNid = StateSnapshotNid(0);

    pub fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EventNid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoomNid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StateSnapshotNid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The (event type, state key) slot a state event occupies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKeyTuple {
    pub event_type: String,
    pub state_key: String,
}

impl StateKeyTuple {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

impl fmt::Display for StateKeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, self.state_key)
    }
}

/// One slot of room state: which event a state key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: StateKeyTuple,
    pub event_nid: EventNid,
}

impl StateEntry {
    pub fn new(key: StateKeyTuple, event_nid: EventNid) -> Self {
        Self { key, event_nid }
    }
}

/// Sorts state entries by key and keeps one entry per state key.
///
/// When several entries share a key, the one with the highest event NID (the
/// most recently stored event) wins.
pub fn deduplicate_state_entries(entries: Vec<StateEntry>) -> Vec<StateEntry> {
    let mut slots: BTreeMap<StateKeyTuple, EventNid> = BTreeMap::new();
    for entry in entries {
        slots
            .entry(entry.key)
            .and_modify(|nid| *nid = (*nid).max(entry.event_nid))
            .or_insert(entry.event_nid);
    }
    slots
        .into_iter()
        .map(|(key, event_nid)| StateEntry { key, event_nid })
        .collect()
}

/// The resolved state immediately before an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAtEvent {
    pub event_nid: EventNid,
    pub before_state_snapshot_nid: StateSnapshotNid,
    /// Replace the room state wholesale instead of merging with it
    pub overwrite: bool,
    pub is_rejected: bool,
    /// The slot this event fills, if it is a state event
    pub state_key: Option<StateKeyTuple>,
}

impl StateAtEvent {
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// The entry this event contributes to the state after it.
    pub fn state_entry(&self) -> Option<StateEntry> {
        self.state_key
            .clone()
            .map(|key| StateEntry::new(key, self.event_nid))
    }
}

/// Per-room metadata kept by the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_nid: RoomNid,
    pub room_version: RoomVersionId,
    pub state_snapshot_nid: StateSnapshotNid,
    /// True until the room has forward extremities
    pub is_stub: bool,
}

/// An event as known to the store.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_nid: EventNid,
    pub event: Arc<PduEvent>,
    pub rejected: bool,
}

/// What the store reports after persisting an event.
#[derive(Debug, Clone)]
pub struct StoreEventOutcome {
    pub room_nid: RoomNid,
    pub event_nid: EventNid,
    pub state_at_event: StateAtEvent,
    /// Set when this write paired a redaction with its target
    pub redaction_event: Option<Arc<PduEvent>>,
    pub redacted_event_id: Option<OwnedEventId>,
}

/// How an event enters the room graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Auth or state event with no timeline position
    Outlier,
    /// Event at the live edge of the room
    New,
    /// Historical event fetched by backfill
    Old,
}

/// Client transaction identifier attached to locally sent events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId {
    pub session_id: i64,
    pub transaction_id: String,
}

/// The unit of work handed to the admission pipeline.
#[derive(Debug, Clone)]
pub struct InputRoomEvent {
    pub kind: InputKind,
    pub event: Arc<PduEvent>,
    pub room_version: RoomVersionId,
    /// Server the event was received from
    pub origin: Option<OwnedServerName>,
    /// `state_event_ids` is the authoritative state before the event
    pub has_state: bool,
    pub state_event_ids: Vec<OwnedEventId>,
    pub send_as_server: Option<OwnedServerName>,
    pub transaction_id: Option<TransactionId>,
}

impl InputRoomEvent {
    pub fn new(kind: InputKind, event: Arc<PduEvent>, room_version: RoomVersionId) -> Self {
        Self {
            kind,
            event,
            room_version,
            origin: None,
            has_state: false,
            state_event_ids: Vec::new(),
            send_as_server: None,
            transaction_id: None,
        }
    }

    pub fn with_origin(mut self, origin: OwnedServerName) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_state(mut self, state_event_ids: Vec<OwnedEventId>) -> Self {
        self.has_state = true;
        self.state_event_ids = state_event_ids;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_send_as_server(mut self, server: OwnedServerName) -> Self {
        self.send_as_server = Some(server);
        self
    }
}

/// Auth and prev references of an event that are not known locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingAuthPrevEvents {
    pub missing_auth_event_ids: Vec<OwnedEventId>,
    pub missing_prev_event_ids: Vec<OwnedEventId>,
}

impl MissingAuthPrevEvents {
    pub fn is_empty(&self) -> bool {
        self.missing_auth_event_ids.is_empty() && self.missing_prev_event_ids.is_empty()
    }
}

/// A new event reached the live edge of the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNewRoomEvent {
    pub event: Arc<PduEvent>,
    pub latest_event_ids: Vec<OwnedEventId>,
    pub send_as_server: Option<OwnedServerName>,
    pub transaction_id: Option<TransactionId>,
    pub rewrites_state: bool,
}

/// Facts emitted to downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    NewRoomEvent(OutputNewRoomEvent),
    OldRoomEvent {
        event: Arc<PduEvent>,
    },
    RedactedEvent {
        redacted_event_id: OwnedEventId,
        redacted_because: Arc<PduEvent>,
    },
}

/// How a room version derives event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdFormat {
    /// `$opaque:server` identifiers chosen by the sender (room versions 1 and 2)
    Opaque,
    /// Identifiers derived from the reference hash of the event
    ReferenceHash,
}

impl EventIdFormat {
    pub fn for_room_version(room_version: &RoomVersionId) -> Self {
        match room_version {
            RoomVersionId::V1 | RoomVersionId::V2 => EventIdFormat::Opaque,
            _ => EventIdFormat::ReferenceHash,
        }
    }
}
