//! Finite State Machine for a single device update

use serde::{Deserialize, Serialize};

use crate::errors::{FailureClass, UpdaterError};
use crate::journal::Outcome;

/// Device update state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Selected, nothing done yet
    Pending,

    /// Build tool running
    Compiling,

    /// Artifact available
    Compiled,

    /// Delivery in progress
    Uploading,

    /// Terminal: success
    Done,

    /// Terminal: error
    Failed,

    /// Terminal: excluded by policy
    Skipped,
}

impl DeviceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Done | DeviceState::Failed | DeviceState::Skipped)
    }

    /// Journal outcome for terminal states
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            DeviceState::Done => Some(Outcome::Done),
            DeviceState::Failed => Some(Outcome::Failed),
            DeviceState::Skipped => Some(Outcome::Skipped),
            _ => None,
        }
    }
}

/// Device update event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Build tool invoked
    StartCompile,

    /// Build finished and the artifact was located
    CompileSucceeded,

    /// A previously built artifact was found (compile phase skipped)
    ArtifactReady,

    /// Delivery started
    StartUpload,

    /// A delivery target accepted the firmware
    UploadSucceeded,

    /// Upload phase not part of this mode
    SkipUpload,

    /// Any error, from any non-terminal state
    Fail(FailureClass),

    /// Excluded by policy, from any non-terminal state
    Skip,
}

/// Device update FSM
#[derive(Debug, Clone)]
pub struct DeviceFsm {
    state: DeviceState,
    failure: Option<FailureClass>,
    failed_in: Option<DeviceState>,
    history: Vec<DeviceState>,
}

impl DeviceFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeviceState::Pending,
            failure: None,
            failed_in: None,
            history: vec![DeviceState::Pending],
        }
    }

    /// Get current state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Failure class, once failed
    pub fn failure(&self) -> Option<FailureClass> {
        self.failure
    }

    /// State the device was in when it failed
    pub fn failed_in(&self) -> Option<DeviceState> {
        self.failed_in
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[DeviceState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeviceEvent) -> Result<DeviceState, UpdaterError> {
        let new_state = match (self.state, &event) {
            // Terminal states absorb nothing
            (state, event) if state.is_terminal() => {
                return Err(UpdaterError::TransitionError(format!(
                    "{:?} is terminal, cannot apply {:?}",
                    state, event
                )));
            }

            (state, DeviceEvent::Fail(class)) => {
                self.failure = Some(*class);
                self.failed_in = Some(state);
                DeviceState::Failed
            }
            (_, DeviceEvent::Skip) => DeviceState::Skipped,

            // From Pending
            (DeviceState::Pending, DeviceEvent::StartCompile) => DeviceState::Compiling,
            (DeviceState::Pending, DeviceEvent::ArtifactReady) => DeviceState::Compiled,

            // From Compiling
            (DeviceState::Compiling, DeviceEvent::CompileSucceeded) => DeviceState::Compiled,

            // From Compiled
            (DeviceState::Compiled, DeviceEvent::StartUpload) => DeviceState::Uploading,
            (DeviceState::Compiled, DeviceEvent::SkipUpload) => DeviceState::Done,

            // From Uploading
            (DeviceState::Uploading, DeviceEvent::UploadSucceeded) => DeviceState::Done,

            // Invalid transitions
            (state, event) => {
                return Err(UpdaterError::TransitionError(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }
}

impl Default for DeviceFsm {
    fn default() -> Self {
        Self::new()
    }
}
