// =============================================================================
// Matrixon Room Server - Pdu Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Description:
//   Persistent data unit (room event) model. Covers the fields the admission
//   pipeline reads, content redaction and reference hashing.
//
// =============================================================================

use std::{cmp::Ordering, sync::Arc};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ruma::{
    canonical_json::{redact_content_in_place, to_canonical_value},
    events::TimelineEventType,
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomVersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use matrixon_common::{MatrixonError, Result};

use crate::types::{EventIdFormat, StateKeyTuple};

/// Content hashes of a PDU.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash.
    pub sha256: String,
}

#[derive(Clone, Deserialize, Debug, Serialize)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub depth: u64,
    pub auth_events: Vec<OwnedEventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    #[serde(default)]
    pub hashes: EventHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Value>,
}

impl PduEvent {
    pub fn event_type(&self) -> String {
        self.kind.to_string()
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_create_event(&self) -> bool {
        self.kind == TimelineEventType::RoomCreate && self.state_key.as_deref() == Some("")
    }

    /// The state slot this event fills, `None` for timeline events.
    pub fn state_key_tuple(&self) -> Option<StateKeyTuple> {
        self.state_key
            .as_ref()
            .map(|key| StateKeyTuple::new(self.event_type(), key.clone()))
    }

    /// `content.membership` of a member event.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != TimelineEventType::RoomMember {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str)
    }

    pub fn references_auth_event(&self, event_id: &EventId) -> bool {
        self.auth_events.iter().any(|id| id == event_id)
    }

    /// The event as a canonical JSON object, as it goes over federation.
    pub fn to_canonical_object(&self) -> Result<CanonicalJsonObject> {
        match to_canonical_value(self)
            .map_err(|e| MatrixonError::Serialization(format!("PDU is not canonical JSON: {e}")))?
        {
            CanonicalJsonValue::Object(object) => Ok(object),
            _ => Err(MatrixonError::Serialization(
                "PDU did not serialize to an object".to_owned(),
            )),
        }
    }

    /// Reference hash under the rules of `room_version`. Hashed-ID room
    /// versions derive the event ID from it, so `event_id` is left out there.
    pub fn reference_hash(&self, room_version: &RoomVersionId) -> Result<String> {
        let mut object = self.to_canonical_object()?;
        if EventIdFormat::for_room_version(room_version) == EventIdFormat::ReferenceHash {
            object.remove("event_id");
        }
        ruma::signatures::reference_hash(&object, room_version)
            .map_err(|e| MatrixonError::Serialization(format!("failed to hash {}: {e}", self.event_id)))
    }

    /// The identifier a hashed-ID room version derives for this event.
    pub fn derived_event_id(&self, room_version: &RoomVersionId) -> Result<OwnedEventId> {
        let id = format!("${}", self.reference_hash(room_version)?);
        EventId::parse(id.as_str())
            .map_err(|e| MatrixonError::Serialization(format!("invalid derived event ID: {e}")))
    }

    /// SHA-256 of the canonical event without `unsigned`, `signatures` and
    /// `hashes`, standard unpadded base64.
    pub fn content_hash(&self, room_version: &RoomVersionId) -> Result<String> {
        let mut object = self.to_canonical_object()?;
        if EventIdFormat::for_room_version(room_version) == EventIdFormat::ReferenceHash {
            object.remove("event_id");
        }
        object.remove("unsigned");
        object.remove("signatures");
        object.remove("hashes");
        let bytes = serde_json::to_vec(&object)?;
        Ok(STANDARD_NO_PAD.encode(Sha256::digest(&bytes)))
    }

    /// A copy of this event with its content redacted under the rules of
    /// `room_version`, carrying `because` in `unsigned.redacted_because`.
    pub fn redacted(&self, because: &PduEvent, room_version: &RoomVersionId) -> Result<PduEvent> {
        debug!(
            "🔨 Redacting event {} because of {}",
            self.event_id, because.event_id
        );

        let mut content = match to_canonical_value(&self.content).map_err(|e| {
            MatrixonError::Serialization(format!("event {} has invalid content: {e}", self.event_id))
        })? {
            CanonicalJsonValue::Object(content) => content,
            _ => CanonicalJsonObject::new(),
        };
        redact_content_in_place(&mut content, room_version, self.event_type()).map_err(|e| {
            MatrixonError::Serialization(format!("failed to redact {}: {e}", self.event_id))
        })?;

        let mut redacted = self.clone();
        redacted.content = serde_json::to_value(&content)?;
        redacted.unsigned = Some(json!({
            "redacted_because": serde_json::to_value(because)?,
        }));
        Ok(redacted)
    }

    pub fn is_redacted(&self) -> bool {
        self.unsigned
            .as_ref()
            .and_then(|unsigned| unsigned.get("redacted_because"))
            .is_some()
    }
}

// Events are identified by their ID alone.
impl Eq for PduEvent {}
impl PartialEq for PduEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}
impl PartialOrd for PduEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PduEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event_id.cmp(&other.event_id)
    }
}

/// Build a PDU field by field.
///
/// When no event ID is given, `build` derives one from the reference hash
/// under the builder's room version (10 unless set).
#[derive(Debug, Clone)]
pub struct PduBuilder {
    event_id: Option<OwnedEventId>,
    room_id: OwnedRoomId,
    sender: OwnedUserId,
    event_type: TimelineEventType,
    content: Value,
    state_key: Option<String>,
    prev_events: Vec<OwnedEventId>,
    auth_events: Vec<OwnedEventId>,
    depth: u64,
    origin_server_ts: u64,
    redacts: Option<OwnedEventId>,
    room_version: RoomVersionId,
}

impl PduBuilder {
    pub fn new(
        room_id: OwnedRoomId,
        sender: OwnedUserId,
        event_type: TimelineEventType,
        content: Value,
    ) -> Self {
        Self {
            event_id: None,
            room_id,
            sender,
            event_type,
            content,
            state_key: None,
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            origin_server_ts: 0,
            redacts: None,
            room_version: RoomVersionId::V10,
        }
    }

    pub fn event_id(mut self, event_id: OwnedEventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn prev_events(mut self, prev_events: Vec<OwnedEventId>) -> Self {
        self.prev_events = prev_events;
        self
    }

    pub fn auth_events(mut self, auth_events: Vec<OwnedEventId>) -> Self {
        self.auth_events = auth_events;
        self
    }

    pub fn depth(mut self, depth: u64) -> Self {
        self.depth = depth;
        self
    }

    pub fn origin_server_ts(mut self, ts: u64) -> Self {
        self.origin_server_ts = ts;
        self
    }

    pub fn redacts(mut self, target: OwnedEventId) -> Self {
        self.redacts = Some(target);
        self
    }

    pub fn room_version(mut self, room_version: RoomVersionId) -> Self {
        self.room_version = room_version;
        self
    }

    pub fn build(self) -> Result<Arc<PduEvent>> {
        let placeholder = EventId::parse("$placeholder")
            .map_err(|e| MatrixonError::Serialization(e.to_string()))?;
        let mut pdu = PduEvent {
            event_id: self.event_id.clone().unwrap_or(placeholder),
            room_id: self.room_id,
            sender: self.sender,
            origin_server_ts: self.origin_server_ts,
            kind: self.event_type,
            content: self.content,
            state_key: self.state_key,
            prev_events: self.prev_events,
            depth: self.depth,
            auth_events: self.auth_events,
            redacts: self.redacts,
            unsigned: None,
            hashes: EventHash::default(),
            signatures: None,
        };
        pdu.hashes.sha256 = pdu.content_hash(&self.room_version)?;
        if self.event_id.is_none() {
            pdu.event_id = pdu.derived_event_id(&self.room_version)?;
        }
        Ok(Arc::new(pdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{event_id, room_id, user_id};

    fn member_event(membership: &str) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomMember,
            json!({ "membership": membership, "displayname": "Alice" }),
        )
        .state_key("@alice:example.org")
        .event_id(event_id!("$member:example.org").to_owned())
        .build()
        .unwrap()
    }

    fn redaction_of(target: &EventId) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@mod:example.org").to_owned(),
            TimelineEventType::RoomRedaction,
            json!({ "reason": "spam" }),
        )
        .redacts(target.to_owned())
        .event_id(event_id!("$redaction:example.org").to_owned())
        .build()
        .unwrap()
    }

    #[test]
    fn test_state_key_tuple() {
        let member = member_event("join");
        assert_eq!(
            member.state_key_tuple(),
            Some(StateKeyTuple::new("m.room.member", "@alice:example.org"))
        );
        assert_eq!(member.membership(), Some("join"));
        assert!(!member.is_create_event());
    }

    #[test]
    fn test_create_event_detection() {
        let create = PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomCreate,
            json!({ "creator": "@alice:example.org", "room_version": "10" }),
        )
        .state_key("")
        .build()
        .unwrap();
        assert!(create.is_create_event());
        assert!(create.is_state());
    }

    #[test]
    fn test_redaction_keeps_membership_only() {
        let member = member_event("join");
        let redaction = redaction_of(&member.event_id);

        let redacted = member.redacted(&redaction, &RoomVersionId::V10).unwrap();

        assert!(redacted.is_redacted());
        assert!(!member.is_redacted());
        assert_eq!(redacted.content, json!({ "membership": "join" }));
        assert_eq!(redacted.event_id, member.event_id);
    }

    #[test]
    fn test_redaction_empties_message_content() {
        let message = PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomMessage,
            json!({ "msgtype": "m.text", "body": "hello" }),
        )
        .build()
        .unwrap();
        let redaction = redaction_of(&message.event_id);

        let redacted = message.redacted(&redaction, &RoomVersionId::V10).unwrap();
        assert_eq!(redacted.content, json!({}));
        assert_eq!(
            redacted.unsigned.as_ref().unwrap()["redacted_because"]["event_id"],
            json!("$redaction:example.org")
        );
    }

    #[test]
    fn test_derived_event_id_is_stable_and_ignores_unsigned() {
        let build = || {
            PduBuilder::new(
                room_id!("!room:example.org").to_owned(),
                user_id!("@alice:example.org").to_owned(),
                TimelineEventType::RoomMessage,
                json!({ "body": "hi" }),
            )
            .depth(3)
            .build()
            .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.event_id, b.event_id);
        assert!(a.event_id.as_str().starts_with('$'));

        let mut with_unsigned = (*a).clone();
        with_unsigned.unsigned = Some(json!({ "age": 10 }));
        assert_eq!(
            with_unsigned.reference_hash(&RoomVersionId::V10).unwrap(),
            a.reference_hash(&RoomVersionId::V10).unwrap()
        );

        let mut edited = (*a).clone();
        edited.depth = 4;
        assert_ne!(
            edited.reference_hash(&RoomVersionId::V10).unwrap(),
            a.reference_hash(&RoomVersionId::V10).unwrap()
        );
    }

    fn create_event(content: serde_json::Value) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomCreate,
            content,
        )
        .state_key("")
        .event_id(event_id!("$create:example.org").to_owned())
        .build()
        .unwrap()
    }

    #[test]
    fn test_create_redaction_follows_room_version() {
        let create = create_event(json!({
            "creator": "@alice:example.org",
            "room_version": "10",
            "m.federate": false,
        }));
        let redaction = redaction_of(&create.event_id);

        let v10 = create.redacted(&redaction, &RoomVersionId::V10).unwrap();
        assert_eq!(v10.content, json!({ "creator": "@alice:example.org" }));

        let v11 = create.redacted(&redaction, &RoomVersionId::V11).unwrap();
        assert_eq!(v11.content, create.content);
    }

    #[test]
    fn test_restricted_join_key_survives_only_where_defined() {
        let join = PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@bob:example.org").to_owned(),
            TimelineEventType::RoomMember,
            json!({
                "membership": "join",
                "join_authorised_via_users_server": "@alice:example.org",
            }),
        )
        .state_key("@bob:example.org")
        .event_id(event_id!("$join:example.org").to_owned())
        .build()
        .unwrap();
        let redaction = redaction_of(&join.event_id);

        let v9 = join.redacted(&redaction, &RoomVersionId::V9).unwrap();
        assert_eq!(
            v9.content["join_authorised_via_users_server"],
            json!("@alice:example.org")
        );
        let v1 = join.redacted(&redaction, &RoomVersionId::V1).unwrap();
        assert_eq!(v1.content, json!({ "membership": "join" }));
    }

    #[test]
    fn test_opaque_reference_hash_tracks_full_content() {
        let a = create_event(json!({ "creator": "@alice:example.org", "m.federate": true }));
        let b = create_event(json!({ "creator": "@alice:example.org", "m.federate": false }));

        // redaction drops m.federate, the content hash still covers it
        assert_ne!(a.hashes.sha256, b.hashes.sha256);
        assert_ne!(
            a.reference_hash(&RoomVersionId::V1).unwrap(),
            b.reference_hash(&RoomVersionId::V1).unwrap()
        );

        let mut signed = (*a).clone();
        signed.signatures = Some(json!({ "example.org": { "ed25519:1": "c2ln" } }));
        assert_eq!(
            signed.reference_hash(&RoomVersionId::V1).unwrap(),
            a.reference_hash(&RoomVersionId::V1).unwrap()
        );
    }
}
