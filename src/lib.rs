//! dialback — reverse-dial WebSocket command channel
//!
//! A worker agent embeds a [`channel::CommandChannel`]: the channel dials a
//! remote controller over WebSocket and then serves request/response commands
//! initiated by that controller, inverting the usual connect/listen polarity.
//! Configuration lives in a typed, validated [`config::ConfigStore`] and can
//! be changed at runtime; the channel heartbeats, reconnects, and shuts down
//! gracefully on its own.

pub mod channel;
pub mod config;
pub mod logging;
pub mod transport;

pub use channel::state::ChannelState;
pub use channel::{
    ChannelError, ChannelHandle, CommandChannel, ConfigCallback, ConnectionRef, MessageHandler,
    ShutdownCallback, StateCallback,
};
pub use config::{ConfigError, ConfigStore, ConfigType, DefaultValueFn};
pub use transport::TransportError;

pub use tokio_tungstenite::tungstenite::Message;
