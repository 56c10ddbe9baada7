// =============================================================================
// Matrixon Room Server - Rooms Module
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Room event ingestion: admission pipeline, auth chain and gap fetching,
//   state calculation, head updates and output fan-out.
//
// =============================================================================

pub mod auth_chain;
pub mod input;
pub mod latest_events;
pub mod missing_state;
pub mod output;
pub mod state;
pub mod state_resolution;
pub mod topology;
