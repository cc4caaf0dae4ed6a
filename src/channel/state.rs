//! Channel lifecycle states.

use std::fmt;

/// Lifecycle state of a [`CommandChannel`](super::CommandChannel).
///
/// The state is owned by the channel's event loop; other threads observe it
/// through [`ChannelHandle`](super::ChannelHandle) accessors, which read a
/// mirror kept under a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, [`initialize`](super::CommandChannel::initialize) not yet
    /// called.
    Uninitialized,
    /// No connection and no dial in flight; a reconnect may be scheduled.
    NotConnected,
    /// A dial is in flight.
    Connecting,
    /// Connected and idle, reading commands from the peer.
    WaitingForRequest,
    /// A command was handed to the message handler; reading is paused until
    /// the reply completes.
    Replying,
    /// A close handshake is in flight.
    Closing,
    /// The event loop has drained and returned.
    ShutDown,
}

impl ChannelState {
    /// The tag used for this state in inspection documents.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Uninitialized => "UNINITIALIZED",
            ChannelState::NotConnected => "NOT_CONNECTED",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::WaitingForRequest => "WAITING_FOR_REQUEST",
            ChannelState::Replying => "REPLYING",
            ChannelState::Closing => "CLOSING",
            ChannelState::ShutDown => "SHUT_DOWN",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
