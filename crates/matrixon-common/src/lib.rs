// =============================================================================
// Matrixon Room Server - Common Library
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Error types shared by every crate of the room server workspace.
//
// =============================================================================

pub mod error;

pub use error::{MatrixonError, RejectionReason, Result};
