// =============================================================================
// Matrixon Room Server - Integration Test Fixtures
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use matrixon_roomserver::{
    core::{
        AuthEvents, AuthVerdict, AuthorizationOracle, EventNid, EventStore, FederationGateway,
        KeyRing, MissingEventsRequest, PduBuilder, PduEvent, RoomInfo, RoomNid, StateAtEvent,
        StateEntry, StateIdsResponse, StateSnapshotNid, StoreEventOutcome, StoredEvent,
    },
    BroadcastOutputNotifier, Collaborators, InputKind, InputRoomEvent, MatrixonError,
    MemoryEventStore, OutputEvent, Result, RoomServerConfig, Services,
};
use ruma::{
    events::TimelineEventType, EventId, OwnedEventId, OwnedRoomId, OwnedServerName, RoomId,
    RoomVersionId, ServerName, UserId,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const ROOM: &str = "!room:example.org";

pub fn room_id() -> OwnedRoomId {
    RoomId::parse(ROOM).unwrap()
}

pub fn id(event_id: &str) -> OwnedEventId {
    EventId::parse(event_id).unwrap()
}

pub fn server(name: &str) -> OwnedServerName {
    ServerName::parse(name).unwrap()
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub struct EventParts<'a> {
    pub id: &'a str,
    pub sender: &'a str,
    pub kind: TimelineEventType,
    pub state_key: Option<&'a str>,
    pub content: Value,
    pub prev: &'a [&'a str],
    pub auth: &'a [&'a str],
    pub depth: u64,
    pub redacts: Option<&'a str>,
}

pub fn build(parts: EventParts<'_>) -> Arc<PduEvent> {
    let ids = |list: &[&str]| list.iter().map(|s| id(s)).collect::<Vec<_>>();
    let mut builder = PduBuilder::new(
        room_id(),
        UserId::parse(parts.sender).unwrap(),
        parts.kind,
        parts.content,
    )
    .event_id(id(parts.id))
    .prev_events(ids(parts.prev))
    .auth_events(ids(parts.auth))
    .depth(parts.depth);
    if let Some(key) = parts.state_key {
        builder = builder.state_key(key);
    }
    if let Some(target) = parts.redacts {
        builder = builder.redacts(id(target));
    }
    builder.build().unwrap()
}

pub fn create_event() -> Arc<PduEvent> {
    build(EventParts {
        id: "$create:example.org",
        sender: "@alice:example.org",
        kind: TimelineEventType::RoomCreate,
        state_key: Some(""),
        content: json!({ "creator": "@alice:example.org", "room_version": "10" }),
        prev: &[],
        auth: &[],
        depth: 1,
        redacts: None,
    })
}

pub fn member(
    event_id: &str,
    user: &str,
    membership: &str,
    prev: &[&str],
    auth: &[&str],
    depth: u64,
) -> Arc<PduEvent> {
    build(EventParts {
        id: event_id,
        sender: user,
        kind: TimelineEventType::RoomMember,
        state_key: Some(user),
        content: json!({ "membership": membership }),
        prev,
        auth,
        depth,
        redacts: None,
    })
}

pub fn message(
    event_id: &str,
    sender: &str,
    prev: &[&str],
    auth: &[&str],
    depth: u64,
) -> Arc<PduEvent> {
    build(EventParts {
        id: event_id,
        sender,
        kind: TimelineEventType::RoomMessage,
        state_key: None,
        content: json!({ "msgtype": "m.text", "body": format!("hello from {event_id}") }),
        prev,
        auth,
        depth,
        redacts: None,
    })
}

pub fn redaction(
    event_id: &str,
    sender: &str,
    target: &str,
    prev: &[&str],
    auth: &[&str],
    depth: u64,
) -> Arc<PduEvent> {
    build(EventParts {
        id: event_id,
        sender,
        kind: TimelineEventType::RoomRedaction,
        state_key: None,
        content: json!({ "reason": "spam" }),
        prev,
        auth,
        depth,
        redacts: Some(target),
    })
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Joined members may send, users may join themselves, content carrying a
/// `forbidden` key is always refused.
pub struct MembershipRules;

impl AuthorizationOracle for MembershipRules {
    fn allowed(&self, event: &PduEvent, auth_events: &AuthEvents) -> Result<AuthVerdict> {
        if event.content.get("forbidden").is_some() {
            return Ok(AuthVerdict::Rejected("forbidden content".to_owned()));
        }
        if event.is_create_event() {
            return Ok(AuthVerdict::Allowed);
        }
        if auth_events.create().is_none() {
            return Ok(AuthVerdict::Rejected("no create event in auth events".to_owned()));
        }

        let own_join = event.kind == TimelineEventType::RoomMember
            && event.state_key.as_deref() == Some(event.sender.as_str())
            && event.membership() == Some("join");
        let joined = auth_events
            .member(event.sender.as_str())
            .and_then(|m| m.membership())
            == Some("join");
        if own_join || joined {
            Ok(AuthVerdict::Allowed)
        } else {
            Ok(AuthVerdict::Rejected(format!("{} is not joined", event.sender)))
        }
    }
}

/// Signature checks that fail for a fixed set of events.
#[derive(Default)]
pub struct FakeKeyRing {
    pub bad: Mutex<HashSet<OwnedEventId>>,
}

#[async_trait]
impl KeyRing for FakeKeyRing {
    async fn verify_event_signatures(&self, event: &PduEvent, _: &RoomVersionId) -> Result<()> {
        if self.bad.lock().unwrap().contains(&event.event_id) {
            return Err(MatrixonError::Signature {
                event_id: event.event_id.clone(),
                reason: "bad signature".to_owned(),
            });
        }
        Ok(())
    }
}

/// The rest of the federation, as seen from this server.
#[derive(Default)]
pub struct FakeFederation {
    pub joined_servers: Mutex<Vec<OwnedServerName>>,
    /// Events the remote servers can serve
    pub events: Mutex<HashMap<OwnedEventId, Arc<PduEvent>>>,
    pub missing_events: Mutex<Vec<Arc<PduEvent>>>,
    pub state_ids: Mutex<HashMap<OwnedEventId, StateIdsResponse>>,
    pub down: Mutex<HashSet<OwnedServerName>>,
    pub delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeFederation {
    pub fn serve(&self, events: &[Arc<PduEvent>]) {
        let mut served = self.events.lock().unwrap();
        for event in events {
            served.insert(event.event_id.clone(), Arc::clone(event));
        }
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn reach(&self, server: &ServerName) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.lock().unwrap().contains(server) {
            return Err(MatrixonError::Federation(format!("{server} is unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl FederationGateway for FakeFederation {
    async fn query_joined_host_server_names(
        &self,
        room_id: &RoomId,
        _exclude_self: bool,
    ) -> Result<Vec<OwnedServerName>> {
        self.record(format!("joined {room_id}"));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.joined_servers.lock().unwrap().clone())
    }

    async fn get_event_auth(
        &self,
        server: &ServerName,
        _room_version: &RoomVersionId,
        _room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<Arc<PduEvent>>> {
        self.record(format!("event_auth {server} {event_id}"));
        self.reach(server).await?;

        let served = self.events.lock().unwrap();
        let start = served
            .get(event_id)
            .ok_or_else(|| MatrixonError::NotFound(event_id.to_string()))?;
        let mut chain: HashMap<OwnedEventId, Arc<PduEvent>> = HashMap::new();
        let mut todo: Vec<OwnedEventId> = start.auth_events.clone();
        while let Some(next) = todo.pop() {
            if chain.contains_key(&next) {
                continue;
            }
            if let Some(event) = served.get(&next) {
                todo.extend(event.auth_events.iter().cloned());
                chain.insert(next, Arc::clone(event));
            }
        }
        Ok(chain.into_values().collect())
    }

    async fn get_missing_events(
        &self,
        server: &ServerName,
        _room_id: &RoomId,
        request: MissingEventsRequest,
    ) -> Result<Vec<Arc<PduEvent>>> {
        self.record(format!("missing_events {server} limit={}", request.limit));
        self.reach(server).await?;
        Ok(self.missing_events.lock().unwrap().clone())
    }

    async fn get_room_state_ids(
        &self,
        server: &ServerName,
        _room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIdsResponse> {
        self.record(format!("state_ids {server} {event_id}"));
        self.reach(server).await?;
        self.state_ids
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .ok_or_else(|| MatrixonError::NotFound(format!("state before {event_id}")))
    }

    async fn get_event(
        &self,
        server: &ServerName,
        _room_version: &RoomVersionId,
        event_id: &EventId,
    ) -> Result<Arc<PduEvent>> {
        self.record(format!("event {server} {event_id}"));
        self.reach(server).await?;
        self.events
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .ok_or_else(|| MatrixonError::NotFound(event_id.to_string()))
    }
}

/// Memory store that counts writes and can fail state lookups on demand.
pub struct CountingStore {
    pub inner: MemoryEventStore,
    pub store_calls: AtomicUsize,
    failing_state_lookups: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryEventStore::new(server("example.org")),
            store_calls: AtomicUsize::new(0),
            failing_state_lookups: AtomicUsize::new(0),
        }
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `count` state lookups by event ID fail.
    pub fn fail_state_lookups(&self, count: usize) {
        self.failing_state_lookups.store(count, Ordering::SeqCst);
    }

    pub fn pending_state_lookup_failures(&self) -> usize {
        self.failing_state_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn events_from_ids(&self, event_ids: &[OwnedEventId]) -> Result<Vec<StoredEvent>> {
        self.inner.events_from_ids(event_ids).await
    }

    async fn events(&self, event_nids: &[EventNid]) -> Result<Vec<StoredEvent>> {
        self.inner.events(event_nids).await
    }

    async fn store_event(
        &self,
        event: Arc<PduEvent>,
        room_version: &RoomVersionId,
        auth_event_nids: &[EventNid],
        is_rejected: bool,
    ) -> Result<StoreEventOutcome> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .store_event(event, room_version, auth_event_nids, is_rejected)
            .await
    }

    async fn room_info(&self, room_id: &RoomId) -> Result<Option<RoomInfo>> {
        self.inner.room_info(room_id).await
    }

    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<StateEntry>> {
        if self
            .failing_state_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MatrixonError::Database("state lookup unavailable".to_owned()));
        }
        self.inner.state_entries_for_event_ids(event_ids).await
    }

    async fn state_entries(&self, snapshot_nid: StateSnapshotNid) -> Result<Vec<StateEntry>> {
        self.inner.state_entries(snapshot_nid).await
    }

    async fn add_state(
        &self,
        room_nid: RoomNid,
        entries: Vec<StateEntry>,
    ) -> Result<StateSnapshotNid> {
        self.inner.add_state(room_nid, entries).await
    }

    async fn set_state(&self, event_nid: EventNid, snapshot_nid: StateSnapshotNid) -> Result<()> {
        self.inner.set_state(event_nid, snapshot_nid).await
    }

    async fn state_at_event_ids(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<HashMap<OwnedEventId, StateAtEvent>> {
        self.inner.state_at_event_ids(event_ids).await
    }

    async fn get_membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        joined_only: bool,
        local_only: bool,
    ) -> Result<Vec<EventNid>> {
        self.inner
            .get_membership_event_nids_for_room(room_nid, joined_only, local_only)
            .await
    }

    async fn latest_event_ids(&self, room_nid: RoomNid) -> Result<Vec<OwnedEventId>> {
        self.inner.latest_event_ids(room_nid).await
    }

    async fn set_latest_events(
        &self,
        room_nid: RoomNid,
        latest_event_ids: Vec<OwnedEventId>,
        current_state: StateSnapshotNid,
    ) -> Result<()> {
        self.inner
            .set_latest_events(room_nid, latest_event_ids, current_state)
            .await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub db: Arc<CountingStore>,
    pub federation: Arc<FakeFederation>,
    pub key_ring: Arc<FakeKeyRing>,
    pub services: Services,
    pub output: Arc<BroadcastOutputNotifier>,
    pub rx: broadcast::Receiver<(OwnedRoomId, OutputEvent)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RoomServerConfig {
            server_name: "example.org".to_owned(),
            ..RoomServerConfig::default()
        })
    }

    pub fn with_config(config: RoomServerConfig) -> Self {
        let db = Arc::new(CountingStore::new());
        let federation = Arc::new(FakeFederation::default());
        let key_ring = Arc::new(FakeKeyRing::default());
        let (collaborators, output) = Collaborators::with_reference_components(
            db.clone(),
            Arc::new(MembershipRules),
            federation.clone(),
            key_ring.clone(),
            256,
        );
        let rx = output.subscribe();
        let services = Services::build(config, collaborators).unwrap();
        Self {
            db,
            federation,
            key_ring,
            services,
            output,
            rx,
        }
    }

    pub async fn admit(&self, kind: InputKind, event: &Arc<PduEvent>) -> Result<()> {
        self.admit_input(InputRoomEvent::new(kind, Arc::clone(event), RoomVersionId::V10))
            .await
    }

    pub async fn admit_input(&self, input: InputRoomEvent) -> Result<()> {
        self.services
            .input_room_event(CancellationToken::new(), input)
            .await
    }

    /// Admits the create event and alice's join as new events.
    pub async fn bootstrap(&mut self) {
        self.admit(InputKind::New, &create_event()).await.unwrap();
        self.admit(
            InputKind::New,
            &member(
                "$alice:example.org",
                "@alice:example.org",
                "join",
                &["$create:example.org"],
                &["$create:example.org"],
                2,
            ),
        )
        .await
        .unwrap();
        self.drain_output();
    }

    pub fn drain_output(&mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn room_info(&self) -> RoomInfo {
        self.db.room_info(&room_id()).await.unwrap().unwrap()
    }

    pub async fn latest(&self) -> Vec<String> {
        let info = self.room_info().await;
        let mut latest: Vec<String> = self
            .db
            .latest_event_ids(info.room_nid)
            .await
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect();
        latest.sort();
        latest
    }

    pub async fn stored(&self, event_id: &str) -> Option<StoredEvent> {
        self.db
            .events_from_ids(&[id(event_id)])
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    pub async fn state_at(&self, event_id: &str) -> StateAtEvent {
        self.db
            .state_at_event_ids(&[id(event_id)])
            .await
            .unwrap()
            .remove(&id(event_id))
            .unwrap()
    }

    /// Event IDs in the room's current state.
    pub async fn current_state(&self) -> Vec<String> {
        let info = self.room_info().await;
        let entries = self.db.state_entries(info.state_snapshot_nid).await.unwrap();
        let nids: Vec<EventNid> = entries.iter().map(|e| e.event_nid).collect();
        let mut ids: Vec<String> = self
            .db
            .events(&nids)
            .await
            .unwrap()
            .iter()
            .map(|s| s.event.event_id.to_string())
            .collect();
        ids.sort();
        ids
    }
}
