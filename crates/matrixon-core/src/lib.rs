//! Matrixon Core Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-03-21
//!
//! Fundamental types and collaborator traits of the Matrixon room server.
//!
//! # Features
//! - Room events (PDUs) and their numeric store handles
//! - State snapshot and auth event types
//! - Traits for storage, authorization, state resolution and federation
//! - Configuration structures
//!
//! # Examples
//! ```rust
//! use matrixon_core::{RoomServerConfig, Result};
//!
//! fn example() -> Result<()> {
//!     let config = RoomServerConfig::default();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod auth_events;
pub mod config;
pub mod pdu;
pub mod traits;
pub mod types;

pub use auth_events::{auth_types_for_event, AuthEvents, KnownEvents};
pub use config::{InputConfig, RoomServerConfig};
pub use matrixon_common::{MatrixonError, RejectionReason, Result};
pub use pdu::{EventHash, PduBuilder, PduEvent};
pub use traits::{
    AuthVerdict, AuthorizationOracle, EventStore, FederationGateway, KeyRing,
    LatestEventsRequest, LatestEventsUpdater, MissingEventsRequest, OutputNotifier,
    StateIdsResponse, StateResolver,
};
pub use types::*;
