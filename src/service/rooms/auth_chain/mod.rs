// =============================================================================
// Matrixon Room Server - Auth Chain Module
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Completes the auth events of an incoming event. Unknown auth events are
//   pulled from federation as a whole auth chain, verified, authorized and
//   persisted dependencies first.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc};

use matrixon_common::{MatrixonError, Result};
use matrixon_core::{
    AuthEvents, AuthVerdict, KnownEvents, PduEvent, StoredEvent,
};
use ruma::{OwnedEventId, OwnedServerName, RoomVersionId};
use tracing::{debug, info, warn};

use crate::{
    metrics,
    service::{
        rooms::topology::{reverse_topological_ordering, TopologicalOrder},
        Collaborators,
    },
};

pub struct Service {
    services: Collaborators,
}

impl Service {
    pub fn new(services: Collaborators) -> Self {
        Self { services }
    }

    /// Makes every auth event of `event` known, both in the returned builders
    /// and in the store.
    ///
    /// Locally stored auth events are loaded without touching the network.
    /// Rejected events are recorded as known but never indexed for auth.
    #[tracing::instrument(skip_all, fields(event_id = %event.event_id, room_id = %event.room_id))]
    pub async fn fetch_auth_events(
        &self,
        event: &PduEvent,
        room_version: &RoomVersionId,
        mut auth: AuthEvents,
        mut known: KnownEvents,
        servers: &[OwnedServerName],
    ) -> Result<(AuthEvents, KnownEvents)> {
        if event.auth_events.is_empty() {
            return Ok((auth, known));
        }

        let stored = self.services.db.events_from_ids(&event.auth_events).await?;
        let found: HashSet<OwnedEventId> =
            stored.iter().map(|s| s.event.event_id.clone()).collect();
        // rejected events stay linkable by NID but never authorize anything
        for stored_event in stored {
            if !stored_event.rejected {
                auth.add_event(Arc::clone(&stored_event.event))?;
            }
            known.insert(stored_event.event.event_id.clone(), stored_event);
        }

        let unknown: Vec<&OwnedEventId> = event
            .auth_events
            .iter()
            .filter(|id| !found.contains(*id))
            .collect();
        if unknown.is_empty() {
            return Ok((auth, known));
        }
        debug!(unknown = ?unknown, "Auth events missing locally");

        let chain = self.request_auth_chain(event, room_version, servers).await?;

        for auth_event in reverse_topological_ordering(&chain, TopologicalOrder::ByAuthEvents) {
            if known.contains_key(&auth_event.event_id) {
                continue;
            }
            if auth_event.room_id != event.room_id {
                return Err(MatrixonError::BadServerResponse(format!(
                    "auth chain of {} contains {} from room {}",
                    event.event_id, auth_event.event_id, auth_event.room_id
                )));
            }

            self.services
                .key_ring
                .verify_event_signatures(&auth_event, room_version)
                .await?;

            let mut auth_event_nids = Vec::with_capacity(auth_event.auth_events.len());
            for id in &auth_event.auth_events {
                let Some(dependency) = known.get(id) else {
                    return Err(MatrixonError::MissingAuthEvent {
                        event_id: auth_event.event_id.clone(),
                        missing: id.clone(),
                    });
                };
                auth_event_nids.push(dependency.event_nid);
            }

            let rejected = match self.services.oracle.allowed(&auth_event, &auth)? {
                AuthVerdict::Allowed => false,
                AuthVerdict::Rejected(reason) => {
                    warn!(auth_event_id = %auth_event.event_id, %reason, "❌ Auth event rejected");
                    true
                }
            };

            let outcome = self
                .services
                .db
                .store_event(Arc::clone(&auth_event), room_version, &auth_event_nids, rejected)
                .await?;

            // indexed only after its own verdict, so later chain members
            // are checked against accepted events alone
            if !rejected {
                auth.add_event(Arc::clone(&auth_event))?;
            }
            known.insert(
                auth_event.event_id.clone(),
                StoredEvent {
                    event_nid: outcome.event_nid,
                    event: auth_event,
                    rejected: outcome.state_at_event.is_rejected,
                },
            );
        }

        Ok((auth, known))
    }

    /// Asks each server in turn for the full auth chain of `event`.
    async fn request_auth_chain(
        &self,
        event: &PduEvent,
        room_version: &RoomVersionId,
        servers: &[OwnedServerName],
    ) -> Result<Vec<Arc<PduEvent>>> {
        for server in servers {
            match self
                .services
                .federation
                .get_event_auth(server, room_version, &event.room_id, &event.event_id)
                .await
            {
                Ok(chain) => {
                    info!(%server, chain_len = chain.len(), "✅ Fetched auth chain");
                    metrics::auth_chain_fetched(true);
                    return Ok(chain);
                }
                Err(e) => {
                    warn!(%server, error = %e, "Failed to get event auth from server");
                }
            }
        }

        metrics::auth_chain_fetched(false);
        Err(MatrixonError::AuthChainUnavailable {
            event_id: event.event_id.clone(),
            tried: servers.to_vec(),
        })
    }
}
