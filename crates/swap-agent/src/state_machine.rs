use crate::error::StateMachineError;
use std::fmt;

/// Stage of one attach session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Dialing the controller
    Connecting,
    /// Reading the request frame
    AwaitingRequest,
    /// Acquiring host capabilities
    CapabilityAcquisition,
    /// Writing and injecting the payload
    BootstrapCheck,
    /// Comparing the resident fingerprint
    VersionCheck,
    /// Hook installed by an earlier attach
    AlreadyInstrumented,
    /// Installing the hook
    InstrumentOnce,
    /// Choosing the immediate or deferred path
    Dispatch,
    /// Redefining classes now
    ImmediateSwap,
    /// Writing the only response
    Respond,
    /// Preparing the restart handoff
    DeferredHandoff,
    /// Writing the interim response and parking the swap
    RespondPending,
    /// Immediate swap answered
    Done,
    /// Interim answered; the final answer belongs to the deferred actor
    DoneDeferred,
    /// Aborted; nothing undone
    Failed,
}

impl SessionState {
    /// Every state, in flow order
    pub const ALL: [Self; 15] = [
        Self::Connecting,
        Self::AwaitingRequest,
        Self::CapabilityAcquisition,
        Self::BootstrapCheck,
        Self::VersionCheck,
        Self::AlreadyInstrumented,
        Self::InstrumentOnce,
        Self::Dispatch,
        Self::ImmediateSwap,
        Self::Respond,
        Self::DeferredHandoff,
        Self::RespondPending,
        Self::Done,
        Self::DoneDeferred,
        Self::Failed,
    ];

    /// Whether the session has ended
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DoneDeferred | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Validates a state transition.
///
/// Illegal transitions panic when built with the `strict-debug` feature.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal session transition attempted: {from:?} -> {to:?}");

        #[cfg(not(feature = "strict-debug"))]
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

#[must_use]
pub fn allowed_transitions(from: SessionState) -> Vec<SessionState> {
    use SessionState::*;
    match from {
        Connecting => vec![AwaitingRequest, Failed],
        AwaitingRequest => vec![CapabilityAcquisition, Failed],
        CapabilityAcquisition => vec![BootstrapCheck, Failed],
        BootstrapCheck => vec![VersionCheck, Failed],
        VersionCheck => vec![AlreadyInstrumented, InstrumentOnce, Failed],
        AlreadyInstrumented => vec![Dispatch, Failed],
        InstrumentOnce => vec![Dispatch, Failed],
        Dispatch => vec![ImmediateSwap, DeferredHandoff, Failed],
        ImmediateSwap => vec![Respond, Failed],
        Respond => vec![Done, Failed],
        DeferredHandoff => vec![RespondPending, Failed],
        RespondPending => vec![DoneDeferred, Failed],
        Done | DoneDeferred | Failed => vec![],
    }
}

fn allowed(from: SessionState, to: SessionState) -> bool {
    allowed_transitions(from).contains(&to)
}
