//! MQTT correlation layer
//!
//! Turns the one-way publish/subscribe traffic with controllers into
//! awaitable exchanges (ping, component command, configuration push) and
//! keeps the broker session alive across transport failures.

mod bridge;
mod connection;
pub mod messages;
mod pending;
mod topics;

pub use bridge::{
    ConfigFeedbackHandler, ConnectionState, MqttBridge, ServerAnnouncement, Transport,
};
pub use connection::{
    ErrorThrottle, RumqttTransport, client_id, client_options, detect_local_ip, run_event_loop,
};
pub use messages::{
    CommandFeedback, ConfigFeedback, FeedbackStatus, PeripheralConfigEntry, PeripheralConfigSet,
};
pub use pending::{Exchange, PendingTable};
pub use topics::{InboundTopic, Topics};
