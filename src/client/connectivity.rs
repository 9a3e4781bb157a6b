//! The five-state connectivity machine shared by subchannels and channels.

/// A connection's lifecycle state. `Shutdown` is terminal: once reached, no
/// further transition is observed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectivityState::Shutdown)
    }
}
