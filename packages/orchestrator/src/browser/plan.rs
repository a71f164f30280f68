// ABOUTME: Pure decision table mapping (desired, actual, retries) to the reconciler's next action
// ABOUTME: Kept free of I/O so every row of the state machine can be tested directly

use lab_storage::{ActualState, DesiredState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Move to `starting`, bump the retry counter and ask the daemon to start
    Start,
    /// Daemon is booting; promote to `running` once it reports ready
    PollStarting,
    /// Confirm a running daemon is still alive
    CheckRunning,
    /// Reset a stuck `stopping` to `stopped` when the daemon is already gone
    RecoverStopping,
    /// Save the current URL then stop the daemon
    Stop,
    /// Force the actual state to `stopped` without touching the daemon
    Normalize,
    RetriesExhausted,
}

pub fn plan(desired: DesiredState, actual: ActualState, retry_count: u32, max_retries: u32) -> Action {
    match desired {
        DesiredState::Running => match actual {
            ActualState::Stopped | ActualState::Error if retry_count >= max_retries => {
                Action::RetriesExhausted
            }
            ActualState::Stopped | ActualState::Error => Action::Start,
            ActualState::Pending => Action::None,
            ActualState::Starting => Action::PollStarting,
            ActualState::Running => Action::CheckRunning,
            ActualState::Stopping => Action::RecoverStopping,
        },
        DesiredState::Stopped => match actual {
            ActualState::Running | ActualState::Starting => Action::Stop,
            ActualState::Pending | ActualState::Stopping | ActualState::Error => Action::Normalize,
            ActualState::Stopped => Action::None,
        },
    }
}
