//! Device presence tracking
//!
//! Controllers announce themselves on the discovery topic and are considered
//! online while they keep being seen within [`HEARTBEAT_WINDOW`].

mod registry;
mod types;

pub use registry::DeviceRegistry;
pub use types::{DeviceEvent, DeviceInfo, HEARTBEAT_WINDOW, is_online};
