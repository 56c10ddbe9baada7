// =============================================================================
// Matrixon Room Server - Event Input Module
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Admits a single event into its room. Drives the event through the
//   admission steps: dependency discovery, auth chain completion,
//   authorization, gap filling, persistence, state calculation and the final
//   notification of downstream consumers.
//
// =============================================================================

mod admission;
mod queue;
mod soft_fail;

use std::{collections::HashSet, mem, sync::Arc, time::Instant};

use futures::future::BoxFuture;
use matrixon_common::{MatrixonError, RejectionReason, Result};
use matrixon_core::{
    AuthEvents, AuthVerdict, EventIdFormat, EventNid, InputConfig, InputKind, InputRoomEvent,
    KnownEvents, LatestEventsRequest, MissingAuthPrevEvents, OutputEvent, PduEvent, RoomInfo,
    StateAtEvent, StateKeyTuple,
};
use ruma::{OwnedEventId, OwnedServerName};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use admission::{AdmissionStep, Facts};
pub use queue::RoomQueues;
pub use soft_fail::check_for_soft_fail;

use crate::{
    metrics,
    service::{
        rooms::{auth_chain, missing_state::MissingStateFetcher, state},
        Collaborators,
    },
};

pub struct Inputer {
    services: Collaborators,
    config: InputConfig,
    auth_chain: auth_chain::Service,
    state: state::Service,
}

/// Everything one admission accumulates between steps.
struct Admission {
    input: InputRoomEvent,
    event: Arc<PduEvent>,
    facts: Facts,
    servers: Vec<OwnedServerName>,
    auth: AuthEvents,
    known: KnownEvents,
    auth_event_nids: Vec<EventNid>,
    rejection: Option<RejectionReason>,
    room_info: Option<RoomInfo>,
    state_at_event: StateAtEvent,
    redaction: Option<(Arc<PduEvent>, OwnedEventId)>,
}

impl Admission {
    fn new(input: InputRoomEvent) -> Self {
        Self {
            event: Arc::clone(&input.event),
            facts: Facts::new(input.kind, input.has_state),
            input,
            servers: Vec::new(),
            auth: AuthEvents::new(),
            known: KnownEvents::new(),
            auth_event_nids: Vec::new(),
            rejection: None,
            room_info: None,
            state_at_event: StateAtEvent::default(),
            redaction: None,
        }
    }

    fn reject(&mut self, reason: RejectionReason) {
        self.facts.rejected = true;
        self.rejection = Some(reason);
    }
}

impl Inputer {
    pub fn new(services: Collaborators, config: InputConfig) -> Self {
        Self {
            auth_chain: auth_chain::Service::new(services.clone()),
            state: state::Service::new(services.clone()),
            services,
            config,
        }
    }

    pub fn services(&self) -> &Collaborators {
        &self.services
    }

    pub fn config(&self) -> &InputConfig {
        &self.config
    }

    /// Admits one event, bounded by the configured processing time and by
    /// the caller's cancellation.
    #[tracing::instrument(skip_all, fields(event_id = %input.event.event_id, room_id = %input.event.room_id, kind = ?input.kind))]
    pub async fn process_room_event(
        &self,
        ctx: &CancellationToken,
        input: InputRoomEvent,
    ) -> Result<()> {
        let event_id = input.event.event_id.clone();
        if ctx.is_cancelled() {
            return Err(MatrixonError::Cancelled(format!(
                "admission of {event_id} cancelled before it started"
            )));
        }

        let limit = self.config.max_processing_time();
        tokio::select! {
            _ = ctx.cancelled() => {
                warn!("Admission cancelled by caller");
                Err(MatrixonError::Cancelled(format!("admission of {event_id} cancelled")))
            }
            result = tokio::time::timeout(limit, self.admit(input)) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(limit_secs = limit.as_secs(), "⚠️ Admission exceeded processing time");
                    Err(MatrixonError::Timeout(format!(
                        "admission of {event_id} took longer than {}s",
                        limit.as_secs()
                    )))
                }
            },
        }
    }

    /// Runs the admission steps for `input` without any outer bound. Used
    /// directly for events admitted while filling a gap.
    pub(crate) fn admit(&self, input: InputRoomEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let started = Instant::now();
            let room_id = input.event.room_id.clone();
            let kind = input.kind;

            let result = self.run_admission(input).await;

            metrics::record_processing_time(&room_id, started.elapsed());
            let outcome = match &result {
                Ok(()) => "admitted",
                Err(e) if e.is_rejection() => "rejected",
                Err(_) => "failed",
            };
            metrics::record_admission(kind, outcome);
            result
        })
    }

    async fn run_admission(&self, input: InputRoomEvent) -> Result<()> {
        let mut admission = Admission::new(input);
        let mut step = AdmissionStep::Start;
        loop {
            self.run_step(step, &mut admission).await?;
            match step.next(&admission.facts) {
                Some(next) => step = next,
                None => return Ok(()),
            }
        }
    }

    async fn run_step(&self, step: AdmissionStep, admission: &mut Admission) -> Result<()> {
        match step {
            AdmissionStep::Start => {
                debug!(event_id = %admission.event.event_id, has_state = admission.input.has_state, "Admitting event");
                Ok(())
            }
            AdmissionStep::Dedup => {
                self.dedup(admission).await;
                Ok(())
            }
            AdmissionStep::ResolveDependencyGap => self.resolve_dependency_gap(admission).await,
            AdmissionStep::FetchAuthChain => {
                let (auth, known) = self
                    .auth_chain
                    .fetch_auth_events(
                        &admission.event,
                        &admission.input.room_version,
                        mem::take(&mut admission.auth),
                        mem::take(&mut admission.known),
                        &admission.servers,
                    )
                    .await?;
                admission.auth = auth;
                admission.known = known;
                Ok(())
            }
            AdmissionStep::AuthorizationCheck => self.authorization_check(admission),
            AdmissionStep::SoftFailCheck => {
                match check_for_soft_fail(&self.services, &admission.input, &admission.event).await
                {
                    Ok(soft_failed) => admission.facts.soft_failed = soft_failed,
                    Err(e) => {
                        warn!(event_id = %admission.event.event_id, error = %e, "Soft-fail check failed, treating event as not soft-failed");
                    }
                }
                Ok(())
            }
            AdmissionStep::MissingPrevResolution => {
                self.resolve_missing_prev(admission).await;
                Ok(())
            }
            AdmissionStep::Persist => self.persist(admission).await,
            AdmissionStep::RedactionApply => {
                if let Some((redaction, _)) = &admission.redaction {
                    admission.event = Arc::new(
                        admission
                            .event
                            .redacted(redaction, &admission.input.room_version)?,
                    );
                }
                Ok(())
            }
            AdmissionStep::OutlierStop => {
                debug!(event_id = %admission.event.event_id, "💾 Stored outlier");
                Ok(())
            }
            AdmissionStep::StateCalculation => {
                let room_info = admission.room_info.as_ref().ok_or_else(|| {
                    MatrixonError::InvalidState(format!(
                        "room {} unknown after storing {}",
                        admission.event.room_id, admission.event.event_id
                    ))
                })?;
                admission.state_at_event = self
                    .state
                    .calculate_and_set_state(
                        &admission.input,
                        room_info,
                        admission.state_at_event.clone(),
                        &admission.event,
                        admission.facts.rejected,
                    )
                    .await?;
                admission.facts.state_known = true;
                Ok(())
            }
            AdmissionStep::RejectionGate => Ok(()),
            AdmissionStep::LatestEventsUpdate => {
                let room_info = admission.room_info.clone().ok_or_else(|| {
                    MatrixonError::InvalidState(format!("room {} unknown", admission.event.room_id))
                })?;
                self.services
                    .latest_events
                    .update_latest_events(LatestEventsRequest {
                        room_info,
                        state_at_event: admission.state_at_event.clone(),
                        event: Arc::clone(&admission.event),
                        send_as_server: admission.input.send_as_server.clone(),
                        transaction_id: admission.input.transaction_id.clone(),
                        rewrites_state: admission.input.has_state,
                    })
                    .await
            }
            AdmissionStep::OldEventEmit => {
                self.services
                    .output
                    .publish(
                        &admission.event.room_id,
                        vec![OutputEvent::OldRoomEvent {
                            event: Arc::clone(&admission.event),
                        }],
                    )
                    .await
            }
            AdmissionStep::RedactionNotify => {
                let Some((redaction, redacted_event_id)) = admission.redaction.clone() else {
                    return Ok(());
                };
                info!(%redacted_event_id, redacted_by = %redaction.event_id, "Event redacted");
                self.services
                    .output
                    .publish(
                        &admission.event.room_id,
                        vec![OutputEvent::RedactedEvent {
                            redacted_event_id,
                            redacted_because: redaction,
                        }],
                    )
                    .await
            }
            AdmissionStep::Stop => {
                debug!(event_id = %admission.event.event_id, "✅ Event admitted");
                Ok(())
            }
            AdmissionStep::Rejected => {
                let reason = if admission.facts.soft_failed && !admission.facts.rejected {
                    RejectionReason::SoftFailed
                } else {
                    admission
                        .rejection
                        .clone()
                        .unwrap_or_else(|| RejectionReason::NotAllowed("rejected".to_owned()))
                };
                debug!(event_id = %admission.event.event_id, %reason, soft_failed = admission.facts.soft_failed, "Stored rejected event");
                Err(MatrixonError::rejected(admission.event.event_id.clone(), reason))
            }
        }
    }

    /// Marks an outlier as a duplicate when an identical copy is stored.
    async fn dedup(&self, admission: &mut Admission) {
        let event = &admission.event;
        let stored = match self.services.db.events_from_ids(&[event.event_id.clone()]).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Failed to look up outlier, storing it again");
                return;
            }
        };
        let Some(existing) = stored.first() else {
            return;
        };

        admission.facts.duplicate =
            match EventIdFormat::for_room_version(&admission.input.room_version) {
                EventIdFormat::ReferenceHash => true,
                // Opaque IDs can be reused for different content
                EventIdFormat::Opaque => {
                    let room_version = &admission.input.room_version;
                    match (
                        existing.event.reference_hash(room_version),
                        event.reference_hash(room_version),
                    ) {
                        (Ok(stored_hash), Ok(incoming_hash)) => stored_hash == incoming_hash,
                        _ => false,
                    }
                }
            };
        if admission.facts.duplicate {
            debug!(event_id = %event.event_id, "Outlier already stored");
        }
    }

    async fn resolve_dependency_gap(&self, admission: &mut Admission) -> Result<()> {
        let event = Arc::clone(&admission.event);
        if event.is_create_event() {
            return Ok(());
        }

        let missing = self.missing_auth_prev_events(&event).await?;
        admission.facts.missing_prev =
            !admission.input.has_state && !missing.missing_prev_event_ids.is_empty();

        if !missing.is_empty() {
            debug!(
                missing_auth = ?missing.missing_auth_event_ids,
                missing_prev = ?missing.missing_prev_event_ids,
                "Event has unknown dependencies"
            );
            admission.servers = self
                .services
                .federation
                .query_joined_host_server_names(&event.room_id, true)
                .await
                .map_err(|e| {
                    MatrixonError::Federation(format!(
                        "failed to query joined servers of {}: {e}",
                        event.room_id
                    ))
                })?;
        }
        if let Some(origin) = &admission.input.origin {
            if !admission.servers.contains(origin) {
                admission.servers.push(origin.clone());
            }
        }
        Ok(())
    }

    fn authorization_check(&self, admission: &mut Admission) -> Result<()> {
        let event = Arc::clone(&admission.event);
        if let AuthVerdict::Rejected(reason) = self.services.oracle.allowed(&event, &admission.auth)? {
            warn!(event_id = %event.event_id, %reason, "❌ Event rejected");
            admission.reject(RejectionReason::NotAllowed(reason));
        }

        let mut auth_event_nids = Vec::with_capacity(event.auth_events.len());
        for id in &event.auth_events {
            let Some(known) = admission.known.get(id) else {
                return Err(MatrixonError::MissingAuthEvent {
                    event_id: event.event_id.clone(),
                    missing: id.clone(),
                });
            };
            auth_event_nids.push(known.event_nid);
        }
        admission.auth_event_nids = auth_event_nids;
        Ok(())
    }

    async fn resolve_missing_prev(&self, admission: &mut Admission) {
        if admission.servers.is_empty() {
            warn!(event_id = %admission.event.event_id, "Missing prev events and no servers to ask");
            admission.reject(RejectionReason::NoServersAvailable);
            return;
        }

        let fetcher = MissingStateFetcher::new(
            self,
            admission.input.room_version.clone(),
            admission.servers.clone(),
        );
        match fetcher.process_event_with_missing_state(&admission.event).await {
            Ok(supplied_state) => {
                if let Some(state_event_ids) = supplied_state {
                    admission.input.has_state = true;
                    admission.input.state_event_ids = state_event_ids;
                    admission.facts.has_state = true;
                }
                admission.facts.missing_prev = false;
            }
            Err(e) => {
                warn!(event_id = %admission.event.event_id, error = %e, "Failed to fill gap before event");
                admission.reject(RejectionReason::MissingState(e.to_string()));
            }
        }
    }

    async fn persist(&self, admission: &mut Admission) -> Result<()> {
        let outcome = self
            .services
            .db
            .store_event(
                Arc::clone(&admission.event),
                &admission.input.room_version,
                &admission.auth_event_nids,
                admission.facts.rejected,
            )
            .await?;

        if let (Some(redaction), Some(redacted_event_id)) =
            (outcome.redaction_event, outcome.redacted_event_id)
        {
            admission.facts.redaction_pending = true;
            admission.facts.redacted_self = redacted_event_id == admission.event.event_id;
            admission.redaction = Some((redaction, redacted_event_id));
        }
        admission.facts.state_known = outcome.state_at_event.before_state_snapshot_nid.is_set();
        admission.state_at_event = outcome.state_at_event;

        if admission.input.kind != InputKind::Outlier {
            admission.room_info = self.services.db.room_info(&admission.event.room_id).await?;
            if admission.room_info.is_none() {
                return Err(MatrixonError::InvalidState(format!(
                    "room info missing for {} after storing {}",
                    admission.event.room_id, admission.event.event_id
                )));
            }
        }
        Ok(())
    }

    /// Auth and prev references of `event` that are not usable locally.
    pub(crate) async fn missing_auth_prev_events(
        &self,
        event: &PduEvent,
    ) -> Result<MissingAuthPrevEvents> {
        let known_auth: HashSet<OwnedEventId> = self
            .services
            .db
            .events_from_ids(&event.auth_events)
            .await?
            .into_iter()
            .map(|stored| stored.event.event_id.clone())
            .collect();

        Ok(MissingAuthPrevEvents {
            missing_auth_event_ids: event
                .auth_events
                .iter()
                .filter(|id| !known_auth.contains(*id))
                .cloned()
                .collect(),
            missing_prev_event_ids: self.missing_prev_events(event).await?,
        })
    }

    /// Prev events of `event` that are not stored or have no known state.
    pub(crate) async fn missing_prev_events(&self, event: &PduEvent) -> Result<Vec<OwnedEventId>> {
        let states = self.services.db.state_at_event_ids(&event.prev_events).await?;
        let create_key = StateKeyTuple::new("m.room.create", "");
        Ok(event
            .prev_events
            .iter()
            .filter(|id| match states.get(*id) {
                Some(state) => {
                    !state.before_state_snapshot_nid.is_set()
                        && state.state_key.as_ref() != Some(&create_key)
                }
                None => true,
            })
            .cloned()
            .collect())
    }
}
