// =============================================================================
// Matrixon Room Server - Services
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Service container wiring the collaborators of the admission pipeline
//   together with the per-room input queues.
//
// =============================================================================

use std::sync::Arc;

use matrixon_core::{
    AuthorizationOracle, EventStore, FederationGateway, InputRoomEvent, KeyRing,
    LatestEventsUpdater, OutputNotifier, Result, RoomServerConfig, StateResolver,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod rooms;

use rooms::{
    input::{Inputer, RoomQueues},
    latest_events::RoomHeadUpdater,
    output::BroadcastOutputNotifier,
    state_resolution::PrevEventsStateResolver,
};

/// Everything the admission pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub db: Arc<dyn EventStore>,
    pub oracle: Arc<dyn AuthorizationOracle>,
    pub resolver: Arc<dyn StateResolver>,
    pub federation: Arc<dyn FederationGateway>,
    pub key_ring: Arc<dyn KeyRing>,
    pub latest_events: Arc<dyn LatestEventsUpdater>,
    pub output: Arc<dyn OutputNotifier>,
}

impl Collaborators {
    /// Wires the bundled resolver, head updater and broadcast notifier
    /// around the given store, oracle and federation access.
    pub fn with_reference_components(
        db: Arc<dyn EventStore>,
        oracle: Arc<dyn AuthorizationOracle>,
        federation: Arc<dyn FederationGateway>,
        key_ring: Arc<dyn KeyRing>,
        output_capacity: usize,
    ) -> (Self, Arc<BroadcastOutputNotifier>) {
        let resolver: Arc<dyn StateResolver> =
            Arc::new(PrevEventsStateResolver::new(Arc::clone(&db)));
        let output = Arc::new(BroadcastOutputNotifier::new(output_capacity));
        let latest_events = Arc::new(RoomHeadUpdater::new(
            Arc::clone(&db),
            Arc::clone(&resolver),
            output.clone() as Arc<dyn OutputNotifier>,
        ));

        let collaborators = Self {
            db,
            oracle,
            resolver,
            federation,
            key_ring,
            latest_events,
            output: output.clone(),
        };
        (collaborators, output)
    }
}

/// The assembled room server.
pub struct Services {
    pub config: RoomServerConfig,
    pub inputer: Arc<Inputer>,
    pub queues: RoomQueues,
}

impl Services {
    pub fn build(config: RoomServerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        crate::metrics::describe();
        let inputer = Arc::new(Inputer::new(collaborators, config.input.clone()));
        let queues = RoomQueues::new(
            Arc::clone(&inputer),
            config.input.room_queue_capacity,
            config.input.room_worker_idle(),
        );
        info!(
            server_name = %config.server_name,
            max_processing_time_secs = config.input.max_processing_time_secs,
            "🚀 Room server input ready"
        );
        Ok(Self {
            config,
            inputer,
            queues,
        })
    }

    /// Admits one event, serialized with every other admission for its room.
    pub async fn input_room_event(
        &self,
        ctx: CancellationToken,
        input: InputRoomEvent,
    ) -> Result<()> {
        self.queues.input_room_event(ctx, input).await
    }
}
