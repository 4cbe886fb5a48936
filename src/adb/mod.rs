//! ADB (Android Debug Bridge) module for device interaction.

mod connection;
mod controller;
pub mod device;
mod input;
mod screenshot;

pub use connection::{AdbConnection, ConnectionType, DeviceInfo};
pub use controller::{AdbController, DEFAULT_MAX_MODEL_EDGE};
pub use screenshot::encode_for_model;
