// =============================================================================
// Matrixon Room Server - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Room event ingestion core: admits local and federated events into the
//   room graph, keeping authorization state, forward extremities and
//   downstream consumers up to date.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod logging;
pub mod metrics;
pub mod service;

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

// Re-export workspace crates
pub use matrixon_common as common;
pub use matrixon_core as core;

pub use database::MemoryEventStore;
pub use matrixon_common::{MatrixonError, RejectionReason, Result};
pub use matrixon_core::{InputKind, InputRoomEvent, OutputEvent, RoomServerConfig};
pub use service::{
    rooms::{
        input::{AdmissionStep, Inputer, RoomQueues},
        latest_events::RoomHeadUpdater,
        output::BroadcastOutputNotifier,
        state_resolution::PrevEventsStateResolver,
    },
    Collaborators, Services,
};
