// =============================================================================
// Matrixon Room Server - In-Memory Event Store
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Event store kept entirely in memory. Implements the full storage contract
//   of the admission pipeline and is used for tests and embedding.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{
    events::TimelineEventType, OwnedEventId, OwnedRoomId, OwnedServerName, RoomId,
    RoomVersionId, UserId,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use matrixon_common::{MatrixonError, Result};
use matrixon_core::{
    deduplicate_state_entries, EventNid, EventStore, PduEvent, RoomInfo, RoomNid,
    StateAtEvent, StateEntry, StateSnapshotNid, StoreEventOutcome, StoredEvent,
};

#[derive(Debug)]
struct EventRecord {
    event: Arc<PduEvent>,
    room_nid: RoomNid,
    rejected: bool,
    auth_event_nids: Vec<EventNid>,
    before_state: StateSnapshotNid,
}

#[derive(Debug)]
struct RoomRecord {
    info: RoomInfo,
    latest_event_ids: Vec<OwnedEventId>,
}

#[derive(Debug, Default)]
struct Tables {
    last_event_nid: u64,
    last_room_nid: u64,
    last_snapshot_nid: u64,
    rooms: HashMap<RoomNid, RoomRecord>,
    roomid_roomnid: HashMap<OwnedRoomId, RoomNid>,
    eventid_eventnid: HashMap<OwnedEventId, EventNid>,
    events: HashMap<EventNid, EventRecord>,
    snapshots: HashMap<StateSnapshotNid, Vec<StateEntry>>,
    /// Redactions that arrived before their target, by target event ID
    pending_redactions: HashMap<OwnedEventId, EventNid>,
    redacted: HashSet<EventNid>,
}

/// `EventStore` backed by in-process hash maps.
#[derive(Debug)]
pub struct MemoryEventStore {
    server_name: OwnedServerName,
    tables: RwLock<Tables>,
}

impl MemoryEventStore {
    pub fn new(server_name: OwnedServerName) -> Self {
        Self {
            server_name,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of events stored, rejected ones included.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Auth event handles recorded for a stored event.
    pub async fn auth_event_nids(&self, event_nid: EventNid) -> Option<Vec<EventNid>> {
        self.tables
            .read()
            .await
            .events
            .get(&event_nid)
            .map(|record| record.auth_event_nids.clone())
    }
}

impl Tables {
    fn room_for_event(&mut self, event: &PduEvent, room_version: &RoomVersionId) -> RoomNid {
        if let Some(room_nid) = self.roomid_roomnid.get(&event.room_id) {
            return *room_nid;
        }
        self.last_room_nid += 1;
        let room_nid = RoomNid(self.last_room_nid);
        self.roomid_roomnid.insert(event.room_id.clone(), room_nid);
        self.rooms.insert(
            room_nid,
            RoomRecord {
                info: RoomInfo {
                    room_nid,
                    room_version: room_version.clone(),
                    state_snapshot_nid: StateSnapshotNid::UNSET,
                    is_stub: true,
                },
                latest_event_ids: Vec::new(),
            },
        );
        debug!("🏠 Created room {} as {}", event.room_id, room_nid);
        room_nid
    }

    fn state_at(&self, event_nid: EventNid, record: &EventRecord) -> StateAtEvent {
        StateAtEvent {
            event_nid,
            before_state_snapshot_nid: record.before_state,
            overwrite: false,
            is_rejected: record.rejected,
            state_key: record.event.state_key_tuple(),
        }
    }

    /// Pairs a freshly stored event with a redaction, in whichever order the
    /// two arrived. Returns the redaction event and the redacted event ID.
    fn pair_redaction(
        &mut self,
        event_nid: EventNid,
    ) -> Result<Option<(Arc<PduEvent>, OwnedEventId)>> {
        let Some(record) = self.events.get(&event_nid) else {
            return Ok(None);
        };
        if record.rejected {
            return Ok(None);
        }
        let event = Arc::clone(&record.event);

        let (redaction_nid, target_nid) = if event.kind == TimelineEventType::RoomRedaction {
            let Some(target_id) = event.redacts.clone() else {
                return Ok(None);
            };
            match self.eventid_eventnid.get(&target_id) {
                Some(target_nid) => (event_nid, *target_nid),
                None => {
                    self.pending_redactions.insert(target_id, event_nid);
                    return Ok(None);
                }
            }
        } else {
            let Some(redaction_nid) = self.pending_redactions.remove(&event.event_id) else {
                return Ok(None);
            };
            (redaction_nid, event_nid)
        };

        if self.redacted.contains(&target_nid) {
            return Ok(None);
        }
        let Some(redaction) = self.events.get(&redaction_nid) else {
            return Ok(None);
        };
        if redaction.rejected {
            return Ok(None);
        }
        let redaction_event = Arc::clone(&redaction.event);
        let redaction_room = redaction.room_nid;
        let Some(room_version) = self
            .rooms
            .get(&redaction_room)
            .map(|room| room.info.room_version.clone())
        else {
            return Ok(None);
        };
        let Some(target) = self.events.get_mut(&target_nid) else {
            return Ok(None);
        };
        if target.room_nid != redaction_room {
            debug!(
                "Ignoring cross-room redaction {} of {}",
                redaction_event.event_id, target.event.event_id
            );
            return Ok(None);
        }

        let redacted_id = target.event.event_id.clone();
        target.event = Arc::new(target.event.redacted(&redaction_event, &room_version)?);
        self.redacted.insert(target_nid);
        info!("🔨 Redacted {} by {}", redacted_id, redaction_event.event_id);
        Ok(Some((redaction_event, redacted_id)))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn events_from_ids(&self, event_ids: &[OwnedEventId]) -> Result<Vec<StoredEvent>> {
        let tables = self.tables.read().await;
        Ok(event_ids
            .iter()
            .filter_map(|id| {
                let nid = tables.eventid_eventnid.get(id)?;
                let record = tables.events.get(nid)?;
                Some(StoredEvent {
                    event_nid: *nid,
                    event: Arc::clone(&record.event),
                    rejected: record.rejected,
                })
            })
            .collect())
    }

    async fn events(&self, event_nids: &[EventNid]) -> Result<Vec<StoredEvent>> {
        let tables = self.tables.read().await;
        Ok(event_nids
            .iter()
            .filter_map(|nid| {
                tables.events.get(nid).map(|record| StoredEvent {
                    event_nid: *nid,
                    event: Arc::clone(&record.event),
                    rejected: record.rejected,
                })
            })
            .collect())
    }

    async fn store_event(
        &self,
        event: Arc<PduEvent>,
        room_version: &RoomVersionId,
        auth_event_nids: &[EventNid],
        is_rejected: bool,
    ) -> Result<StoreEventOutcome> {
        let mut tables = self.tables.write().await;
        let room_nid = tables.room_for_event(&event, room_version);

        let event_nid = match tables.eventid_eventnid.get(&event.event_id).copied() {
            Some(existing) => {
                if let Some(record) = tables.events.get_mut(&existing) {
                    // rejection is sticky across re-stores
                    record.rejected |= is_rejected;
                }
                debug!("📖 Event {} already stored as {}", event.event_id, existing);
                existing
            }
            None => {
                tables.last_event_nid += 1;
                let event_nid = EventNid(tables.last_event_nid);
                tables.eventid_eventnid.insert(event.event_id.clone(), event_nid);
                tables.events.insert(
                    event_nid,
                    EventRecord {
                        event: Arc::clone(&event),
                        room_nid,
                        rejected: is_rejected,
                        auth_event_nids: auth_event_nids.to_vec(),
                        before_state: StateSnapshotNid::UNSET,
                    },
                );
                debug!("💾 Stored event {} as {}", event.event_id, event_nid);
                event_nid
            }
        };

        let (redaction_event, redacted_event_id) = match tables.pair_redaction(event_nid)? {
            Some((redaction, redacted)) => (Some(redaction), Some(redacted)),
            None => (None, None),
        };

        let record = tables.events.get(&event_nid).ok_or_else(|| {
            MatrixonError::Database(format!("event {} vanished while storing", event.event_id))
        })?;
        let state_at_event = tables.state_at(event_nid, record);

        Ok(StoreEventOutcome {
            room_nid,
            event_nid,
            state_at_event,
            redaction_event,
            redacted_event_id,
        })
    }

    async fn room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        let tables = self.tables.read().await;
        Ok(tables
            .roomid_roomnid
            .get(room_id)
            .and_then(|nid| tables.rooms.get(nid))
            .map(|room| room.info.clone()))
    }

    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<StateEntry>> {
        let tables = self.tables.read().await;
        event_ids
            .iter()
            .map(|id| {
                let nid = tables
                    .eventid_eventnid
                    .get(id)
                    .ok_or_else(|| MatrixonError::NotFound(format!("state event {id}")))?;
                let record = tables
                    .events
                    .get(nid)
                    .ok_or_else(|| MatrixonError::NotFound(format!("state event {id}")))?;
                let key = record.event.state_key_tuple().ok_or_else(|| {
                    MatrixonError::InvalidState(format!("event {id} is not a state event"))
                })?;
                Ok(StateEntry::new(key, *nid))
            })
            .collect()
    }

    async fn state_entries(&self, snapshot_nid: StateSnapshotNid) -> Result<Vec<StateEntry>> {
        if !snapshot_nid.is_set() {
            return Ok(Vec::new());
        }
        self.tables
            .read()
            .await
            .snapshots
            .get(&snapshot_nid)
            .cloned()
            .ok_or_else(|| MatrixonError::NotFound(format!("state snapshot {snapshot_nid}")))
    }

    async fn add_state(
        &self,
        room_nid: RoomNid,
        entries: Vec<StateEntry>,
    ) -> Result<StateSnapshotNid> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&room_nid) {
            return Err(MatrixonError::NotFound(format!("room {room_nid}")));
        }
        tables.last_snapshot_nid += 1;
        let snapshot_nid = StateSnapshotNid(tables.last_snapshot_nid);
        let entries = deduplicate_state_entries(entries);
        debug!(
            "📸 Stored snapshot {} with {} entries for room {}",
            snapshot_nid,
            entries.len(),
            room_nid
        );
        tables.snapshots.insert(snapshot_nid, entries);
        Ok(snapshot_nid)
    }

    async fn set_state(&self, event_nid: EventNid, snapshot_nid: StateSnapshotNid) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .events
            .get_mut(&event_nid)
            .ok_or_else(|| MatrixonError::NotFound(format!("event {event_nid}")))?;
        if record.before_state.is_set() && record.before_state != snapshot_nid {
            return Err(MatrixonError::InvalidState(format!(
                "state before {} is already {}",
                record.event.event_id, record.before_state
            )));
        }
        record.before_state = snapshot_nid;
        Ok(())
    }

    async fn state_at_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, StateAtEvent>> {
        let tables = self.tables.read().await;
        Ok(event_ids
            .iter()
            .filter_map(|id| {
                let nid = tables.eventid_eventnid.get(id)?;
                let record = tables.events.get(nid)?;
                Some((id.clone(), tables.state_at(*nid, record)))
            })
            .collect())
    }

    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> Result<Vec<EventNid>> {
        let tables = self.tables.read().await;
        let room = tables
            .rooms
            .get(&room_nid)
            .ok_or_else(|| MatrixonError::NotFound(format!("room {room_nid}")))?;
        let Some(entries) = tables.snapshots.get(&room.info.state_snapshot_nid) else {
            return Ok(Vec::new());
        };

        Ok(entries
            .iter()
            .filter(|entry| entry.key.event_type == "m.room.member")
            .filter(|entry| {
                !local_only
                    || UserId::parse(entry.key.state_key.as_str())
                        .map(|user| *user.server_name() == *self.server_name)
                        .unwrap_or(false)
            })
            .filter(|entry| {
                !joined_only
                    || tables
                        .events
                        .get(&entry.event_nid)
                        .and_then(|record| record.event.membership().map(|m| m == "join"))
                        .unwrap_or(false)
            })
            .map(|entry| entry.event_nid)
            .collect())
    }

    async fn latest_event_ids(&self, room_nid: RoomNid) -> Result<Vec<OwnedEventId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .rooms
            .get(&room_nid)
            .map(|room| room.latest_event_ids.clone())
            .unwrap_or_default())
    }

    async fn set_latest_events(
        &self,
        room_nid: RoomNid,
        latest_event_ids: Vec<OwnedEventId>,
        current_state: StateSnapshotNid,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let room = tables
            .rooms
            .get_mut(&room_nid)
            .ok_or_else(|| MatrixonError::NotFound(format!("room {room_nid}")))?;
        room.latest_event_ids = latest_event_ids;
        room.info.state_snapshot_nid = current_state;
        room.info.is_stub = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixon_core::{PduBuilder, StateKeyTuple};
    use ruma::{event_id, room_id, server_name, user_id, EventId};
    use serde_json::json;
    use test_log::test;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(server_name!("example.org").to_owned())
    }

    fn message(id: &EventId) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomMessage,
            json!({ "msgtype": "m.text", "body": "secret" }),
        )
        .event_id(id.to_owned())
        .build()
        .unwrap()
    }

    fn redaction(id: &EventId, target: &EventId) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            user_id!("@alice:example.org").to_owned(),
            TimelineEventType::RoomRedaction,
            json!({}),
        )
        .redacts(target.to_owned())
        .event_id(id.to_owned())
        .build()
        .unwrap()
    }

    fn member(id: &EventId, user: &str, membership: &str) -> Arc<PduEvent> {
        PduBuilder::new(
            room_id!("!room:example.org").to_owned(),
            UserId::parse(user).unwrap(),
            TimelineEventType::RoomMember,
            json!({ "membership": membership }),
        )
        .state_key(user)
        .event_id(id.to_owned())
        .build()
        .unwrap()
    }

    #[test(tokio::test)]
    async fn test_event_nids_are_stable_across_restores() {
        let db = store();
        let ev = message(event_id!("$m1:example.org"));

        let first = db.store_event(ev.clone(), &RoomVersionId::V10, &[], false).await.unwrap();
        let second = db.store_event(ev, &RoomVersionId::V10, &[], false).await.unwrap();

        assert_eq!(first.event_nid, second.event_nid);
        assert_eq!(first.room_nid, second.room_nid);
        assert_eq!(db.event_count().await, 1);
    }

    #[test(tokio::test)]
    async fn test_rejection_is_sticky() {
        let db = store();
        let ev = message(event_id!("$m1:example.org"));

        db.store_event(ev.clone(), &RoomVersionId::V10, &[], true).await.unwrap();
        let again = db.store_event(ev, &RoomVersionId::V10, &[], false).await.unwrap();

        assert!(again.state_at_event.is_rejected);
        let stored = db
            .events_from_ids(&[event_id!("$m1:example.org").to_owned()])
            .await
            .unwrap();
        assert!(stored[0].rejected);
    }

    #[test(tokio::test)]
    async fn test_redaction_after_target() {
        let db = store();
        let target = message(event_id!("$m1:example.org"));
        let redact = redaction(event_id!("$r1:example.org"), &target.event_id);

        let stored = db.store_event(target, &RoomVersionId::V10, &[], false).await.unwrap();
        let outcome = db.store_event(redact, &RoomVersionId::V10, &[], false).await.unwrap();

        assert_eq!(
            outcome.redacted_event_id.as_deref(),
            Some(event_id!("$m1:example.org"))
        );
        assert_eq!(
            outcome.redaction_event.as_ref().map(|e| e.event_id.clone()),
            Some(event_id!("$r1:example.org").to_owned())
        );

        let after = db.events(&[stored.event_nid]).await.unwrap();
        assert!(after[0].event.is_redacted());
        assert_eq!(after[0].event.content, json!({}));
        assert_eq!(after[0].event_nid, stored.event_nid);
    }

    #[test(tokio::test)]
    async fn test_redaction_before_target() {
        let db = store();
        let target = message(event_id!("$m1:example.org"));
        let redact = redaction(event_id!("$r1:example.org"), &target.event_id);

        let early = db.store_event(redact, &RoomVersionId::V10, &[], false).await.unwrap();
        assert!(early.redacted_event_id.is_none());

        let outcome = db.store_event(target, &RoomVersionId::V10, &[], false).await.unwrap();
        assert_eq!(
            outcome.redacted_event_id.as_deref(),
            Some(event_id!("$m1:example.org"))
        );
    }

    #[test(tokio::test)]
    async fn test_rejected_redaction_is_not_applied() {
        let db = store();
        let target = message(event_id!("$m1:example.org"));
        let redact = redaction(event_id!("$r1:example.org"), &target.event_id);

        db.store_event(target, &RoomVersionId::V10, &[], false).await.unwrap();
        let outcome = db.store_event(redact, &RoomVersionId::V10, &[], true).await.unwrap();

        assert!(outcome.redacted_event_id.is_none());
        let stored = db
            .events_from_ids(&[event_id!("$m1:example.org").to_owned()])
            .await
            .unwrap();
        assert!(!stored[0].event.is_redacted());
    }

    #[test(tokio::test)]
    async fn test_snapshots_are_deduplicated() {
        let db = store();
        let ev = message(event_id!("$m1:example.org"));
        let outcome = db.store_event(ev, &RoomVersionId::V10, &[], false).await.unwrap();

        let key = StateKeyTuple::new("m.room.name", "");
        let snapshot = db
            .add_state(
                outcome.room_nid,
                vec![
                    StateEntry::new(key.clone(), EventNid(3)),
                    StateEntry::new(key.clone(), EventNid(8)),
                ],
            )
            .await
            .unwrap();

        let entries = db.state_entries(snapshot).await.unwrap();
        assert_eq!(entries, vec![StateEntry::new(key, EventNid(8))]);
    }

    #[test(tokio::test)]
    async fn test_set_state_is_write_once() {
        let db = store();
        let ev = message(event_id!("$m1:example.org"));
        let outcome = db.store_event(ev, &RoomVersionId::V10, &[], false).await.unwrap();
        let a = db.add_state(outcome.room_nid, Vec::new()).await.unwrap();
        let b = db.add_state(outcome.room_nid, Vec::new()).await.unwrap();

        db.set_state(outcome.event_nid, a).await.unwrap();
        db.set_state(outcome.event_nid, a).await.unwrap();
        assert!(db.set_state(outcome.event_nid, b).await.is_err());
    }

    #[test(tokio::test)]
    async fn test_local_joined_members() {
        let db = store();
        let local = member(event_id!("$j1:example.org"), "@alice:example.org", "join");
        let remote = member(event_id!("$j2:remote.org"), "@bob:remote.org", "join");
        let left = member(event_id!("$l1:example.org"), "@carol:example.org", "leave");

        let mut entries = Vec::new();
        let mut room_nid = RoomNid::default();
        for ev in [local, remote, left] {
            let outcome = db.store_event(ev, &RoomVersionId::V10, &[], false).await.unwrap();
            room_nid = outcome.room_nid;
            entries.push(outcome.state_at_event.state_entry().unwrap());
        }
        let snapshot = db.add_state(room_nid, entries).await.unwrap();
        db.set_latest_events(room_nid, Vec::new(), snapshot).await.unwrap();

        let joined_local = db
            .get_membership_event_nids_for_room(room_nid, true, true)
            .await
            .unwrap();
        assert_eq!(joined_local, vec![EventNid(1)]);

        let all_members = db
            .get_membership_event_nids_for_room(room_nid, false, false)
            .await
            .unwrap();
        assert_eq!(all_members.len(), 3);
    }

    #[test(tokio::test)]
    async fn test_state_entries_for_unknown_event_fails() {
        let db = store();
        let result = db
            .state_entries_for_event_ids(&[event_id!("$nope:example.org").to_owned()])
            .await;
        assert!(matches!(result, Err(MatrixonError::NotFound(_))));
    }
}
