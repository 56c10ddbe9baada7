// =============================================================================
// Matrixon Room Server - Auth Events Index
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Description:
//   Per-admission index of the auth events an event references, keyed by
//   state slot, and the known-events map threaded through chain fetching.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use ruma::{events::TimelineEventType, OwnedEventId};

use matrixon_common::{MatrixonError, Result};

use crate::{
    pdu::PduEvent,
    types::{StateKeyTuple, StoredEvent},
};

/// Event types that can take part in authorization.
pub const AUTH_EVENT_TYPES: &[&str] = &[
    "m.room.create",
    "m.room.power_levels",
    "m.room.join_rules",
    "m.room.member",
    "m.room.third_party_invite",
];

/// Events durably known during one admission, by event ID.
pub type KnownEvents = HashMap<OwnedEventId, StoredEvent>;

/// Auth events of a single event, indexed by state slot.
#[derive(Debug, Clone, Default)]
pub struct AuthEvents {
    events: BTreeMap<StateKeyTuple, Arc<PduEvent>>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `event` under its state slot.
    ///
    /// Events whose type never takes part in authorization are ignored. An
    /// event without a state key cannot be indexed.
    pub fn add_event(&mut self, event: Arc<PduEvent>) -> Result<()> {
        let Some(key) = event.state_key_tuple() else {
            return Err(MatrixonError::InvalidState(format!(
                "auth event {} has no state key",
                event.event_id
            )));
        };
        if !AUTH_EVENT_TYPES.contains(&key.event_type.as_str()) {
            return Ok(());
        }
        self.events.insert(key, event);
        Ok(())
    }

    pub fn get(&self, key: &StateKeyTuple) -> Option<&Arc<PduEvent>> {
        self.events.get(key)
    }

    pub fn create(&self) -> Option<&Arc<PduEvent>> {
        self.events.get(&StateKeyTuple::new("m.room.create", ""))
    }

    pub fn power_levels(&self) -> Option<&Arc<PduEvent>> {
        self.events.get(&StateKeyTuple::new("m.room.power_levels", ""))
    }

    pub fn join_rules(&self) -> Option<&Arc<PduEvent>> {
        self.events.get(&StateKeyTuple::new("m.room.join_rules", ""))
    }

    pub fn member(&self, user_id: &str) -> Option<&Arc<PduEvent>> {
        self.events.get(&StateKeyTuple::new("m.room.member", user_id))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKeyTuple, &Arc<PduEvent>)> {
        self.events.iter()
    }
}

/// The state slots whose current holders authorize `event`.
pub fn auth_types_for_event(event: &PduEvent) -> Vec<StateKeyTuple> {
    if event.is_create_event() {
        return Vec::new();
    }

    let mut needed = vec![
        StateKeyTuple::new("m.room.create", ""),
        StateKeyTuple::new("m.room.power_levels", ""),
        StateKeyTuple::new("m.room.member", event.sender.as_str()),
    ];

    if event.kind == TimelineEventType::RoomMember {
        if let Some(target) = &event.state_key {
            let target_key = StateKeyTuple::new("m.room.member", target.clone());
            if !needed.contains(&target_key) {
                needed.push(target_key);
            }
        }

        let membership = event.membership();
        if matches!(membership, Some("join") | Some("invite") | Some("knock")) {
            needed.push(StateKeyTuple::new("m.room.join_rules", ""));
        }
        if membership == Some("invite") {
            let token = event
                .content
                .get("third_party_invite")
                .and_then(|invite| invite.get("signed"))
                .and_then(|signed| signed.get("token"))
                .and_then(|token| token.as_str());
            if let Some(token) = token {
                needed.push(StateKeyTuple::new("m.room.third_party_invite", token));
            }
        }
    }

    needed
}
