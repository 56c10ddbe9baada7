// =============================================================================
// Matrixon Room Server - Admission Steps
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The steps an event goes through on its way into a room and the pure
//   transition table between them.
//
// =============================================================================

use matrixon_core::InputKind;

/// One step of admitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStep {
    Start,
    Dedup,
    ResolveDependencyGap,
    FetchAuthChain,
    AuthorizationCheck,
    SoftFailCheck,
    MissingPrevResolution,
    Persist,
    RedactionApply,
    OutlierStop,
    StateCalculation,
    RejectionGate,
    LatestEventsUpdate,
    OldEventEmit,
    RedactionNotify,
    Stop,
    Rejected,
}

/// What the pipeline has learned so far about the event being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facts {
    pub kind: InputKind,
    pub has_state: bool,
    /// The same event is already stored
    pub duplicate: bool,
    /// Prev events lack state and no state was supplied
    pub missing_prev: bool,
    pub rejected: bool,
    pub soft_failed: bool,
    /// Persisting the event redacted the event itself
    pub redacted_self: bool,
    /// Persisting the event redacted some event
    pub redaction_pending: bool,
    /// The before-state of the event is already recorded
    pub state_known: bool,
}

impl Facts {
    pub fn new(kind: InputKind, has_state: bool) -> Self {
        Self {
            kind,
            has_state,
            duplicate: false,
            missing_prev: false,
            rejected: false,
            soft_failed: false,
            redacted_self: false,
            redaction_pending: false,
            state_known: false,
        }
    }
}

impl AdmissionStep {
    /// The step following `self`, or `None` once admission is over.
    pub fn next(self, facts: &Facts) -> Option<AdmissionStep> {
        use AdmissionStep::*;

        let step = match self {
            Start if facts.kind == InputKind::Outlier => Dedup,
            Start => ResolveDependencyGap,
            Dedup if facts.duplicate => Stop,
            Dedup => ResolveDependencyGap,
            ResolveDependencyGap => FetchAuthChain,
            FetchAuthChain => AuthorizationCheck,
            AuthorizationCheck if facts.kind == InputKind::New => SoftFailCheck,
            AuthorizationCheck => Persist,
            SoftFailCheck if facts.missing_prev => MissingPrevResolution,
            SoftFailCheck => Persist,
            MissingPrevResolution => Persist,
            Persist if facts.redacted_self && !facts.rejected => RedactionApply,
            Persist | RedactionApply => after_redaction(facts),
            OutlierStop => Stop,
            StateCalculation => RejectionGate,
            RejectionGate if facts.rejected || facts.soft_failed => Rejected,
            RejectionGate if facts.kind == InputKind::New => LatestEventsUpdate,
            RejectionGate => OldEventEmit,
            LatestEventsUpdate | OldEventEmit if facts.redaction_pending => RedactionNotify,
            LatestEventsUpdate | OldEventEmit => Stop,
            RedactionNotify => Stop,
            Stop | Rejected => return None,
        };
        Some(step)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AdmissionStep::Stop | AdmissionStep::Rejected)
    }
}

fn after_redaction(facts: &Facts) -> AdmissionStep {
    if facts.kind == InputKind::Outlier {
        AdmissionStep::OutlierStop
    } else if !facts.missing_prev && !facts.state_known {
        AdmissionStep::StateCalculation
    } else {
        AdmissionStep::RejectionGate
    }
}
