// =============================================================================
// Matrixon Room Server - Output Notifier
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Fans admission outcomes out to in-process subscribers over a tokio
//   broadcast channel.
//
// =============================================================================

use async_trait::async_trait;
use matrixon_common::Result;
use matrixon_core::{OutputEvent, OutputNotifier};
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::metrics;

pub struct BroadcastOutputNotifier {
    sender: broadcast::Sender<(OwnedRoomId, OutputEvent)>,
}

impl BroadcastOutputNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<(OwnedRoomId, OutputEvent)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl OutputNotifier for BroadcastOutputNotifier {
    async fn publish(&self, room_id: &RoomId, events: Vec<OutputEvent>) -> Result<()> {
        for event in events {
            metrics::output_event_published(&event);
            // No subscriber is not an error
            if self.sender.send((room_id.to_owned(), event)).is_err() {
                trace!(%room_id, "No output subscribers");
            }
        }
        debug!(%room_id, subscribers = self.sender.receiver_count(), "Published output events");
        Ok(())
    }
}
