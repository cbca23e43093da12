//! Connection lifecycle states
//!
//! A connection progresses `Connecting → Open → CloseSent → Closed` and
//! never moves backwards. `Closed` is terminal.

/// Lifecycle state of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Bound to a stream, receive loop not yet started
    Connecting,
    /// Normal operation
    Open,
    /// Close initiated (locally or by the peer), awaiting completion
    CloseSent,
    /// Terminal: stream and close-hook released
    Closed,
}

impl ReadyState {
    /// States that permit initiating a close are Open and CloseSent.
    pub fn check_closable(self) -> Result<(), &'static str> {
        match self {
            ReadyState::Connecting => Err("connection has not been opened"),
            ReadyState::Closed => Err("connection is already closed"),
            ReadyState::Open | ReadyState::CloseSent => Ok(()),
        }
    }

    /// Sends are only permitted while Open.
    pub fn check_open(self) -> Result<(), &'static str> {
        match self {
            ReadyState::Open => Ok(()),
            ReadyState::Connecting => Err("connection has not been opened"),
            ReadyState::CloseSent => Err("connection is closing"),
            ReadyState::Closed => Err("connection is closed"),
        }
    }

    /// Check if this is the terminal state
    #[inline]
    pub fn is_closed(self) -> bool {
        self == ReadyState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closable_states() {
        assert!(ReadyState::Connecting.check_closable().is_err());
        assert!(ReadyState::Open.check_closable().is_ok());
        assert!(ReadyState::CloseSent.check_closable().is_ok());
        assert!(ReadyState::Closed.check_closable().is_err());
    }

    #[test]
    fn open_state_only_permits_sends() {
        assert!(ReadyState::Connecting.check_open().is_err());
        assert!(ReadyState::Open.check_open().is_ok());
        assert!(ReadyState::CloseSent.check_open().is_err());
        assert!(ReadyState::Closed.check_open().is_err());
    }
}
