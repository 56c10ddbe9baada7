// Matrixon Room Server - Metrics Module
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-19
// Version: 1.0
// Purpose: Admission pipeline metrics recorded through the `metrics` facade.
//          No exporter is installed here; the embedding binary picks one.

use std::time::Duration;

use ::metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use matrixon_core::{InputKind, OutputEvent};
use ruma::RoomId;

pub const PROCESS_ROOM_EVENT_DURATION: &str =
    "matrixon_roomserver_processroomevent_duration_millis";
pub const ADMISSIONS_TOTAL: &str = "matrixon_roomserver_admissions_total";
pub const AUTH_CHAIN_FETCHES_TOTAL: &str = "matrixon_roomserver_auth_chain_fetches_total";
pub const MISSING_STATE_FETCHES_TOTAL: &str = "matrixon_roomserver_missing_state_fetches_total";
pub const OUTPUT_EVENTS_TOTAL: &str = "matrixon_roomserver_output_events_total";

/// Registers descriptions with whatever recorder is installed.
pub fn describe() {
    describe_histogram!(
        PROCESS_ROOM_EVENT_DURATION,
        Unit::Milliseconds,
        "How long it takes the roomserver to process an event"
    );
    describe_counter!(ADMISSIONS_TOTAL, "Admission outcomes by input kind");
    describe_counter!(
        AUTH_CHAIN_FETCHES_TOTAL,
        "Auth chain requests made to federation"
    );
    describe_counter!(
        MISSING_STATE_FETCHES_TOTAL,
        "Missing prev event reconstructions"
    );
    describe_counter!(OUTPUT_EVENTS_TOTAL, "Output events published");
}

fn kind_label(kind: InputKind) -> &'static str {
    match kind {
        InputKind::Outlier => "outlier",
        InputKind::New => "new",
        InputKind::Old => "old",
    }
}

pub fn record_admission(kind: InputKind, outcome: &'static str) {
    counter!(ADMISSIONS_TOTAL, "kind" => kind_label(kind), "outcome" => outcome).increment(1);
}

pub fn record_processing_time(room_id: &RoomId, elapsed: Duration) {
    histogram!(PROCESS_ROOM_EVENT_DURATION, "room_id" => room_id.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}

pub fn auth_chain_fetched(success: bool) {
    let result = if success { "ok" } else { "failed" };
    counter!(AUTH_CHAIN_FETCHES_TOTAL, "result" => result).increment(1);
}

pub fn missing_state_fetched(success: bool) {
    let result = if success { "ok" } else { "failed" };
    counter!(MISSING_STATE_FETCHES_TOTAL, "result" => result).increment(1);
}

pub fn output_event_published(event: &OutputEvent) {
    let event_type = match event {
        OutputEvent::NewRoomEvent(_) => "new_room_event",
        OutputEvent::OldRoomEvent { .. } => "old_room_event",
        OutputEvent::RedactedEvent { .. } => "redacted_event",
    };
    counter!(OUTPUT_EVENTS_TOTAL, "type" => event_type).increment(1);
}
