//! # tuya-plug
//!
//! Local control of Tuya smart plugs and power strips (protocol 3.1 and 3.3)
//! over the LAN, without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_plug::{DeviceModel, DpsIndex, PlugConfig, PlugController};
//!
//! struct Printer;
//!
//! impl DeviceModel for Printer {
//!     fn update_switch(&mut self, index: DpsIndex, is_on: bool) {
//!         println!("switch {} is {}", index, if is_on { "on" } else { "off" });
//!     }
//! }
//!
//! # async fn run() -> tuya_plug::error::Result<()> {
//! let config = PlugConfig::from_parameters(
//!     "192.168.1.20", "DEVICE_ID", "0123456789abcdef", "1;2", "None", "None",
//! )?;
//! let handle = PlugController::new(config, Printer)?.spawn();
//! handle.command(1, "On", 0).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod device;
pub mod error;
pub mod payload;
pub mod plugs;
pub mod protocol;
pub mod reconcile;

pub use config::PlugConfig;
pub use controller::{ControllerHandle, PlugController};
pub use device::{DeviceSession, LinkState, Received};
pub use error::TuyaError;
pub use payload::{Dps, DpsIndex, MeterConfig, MeterReading};
pub use plugs::{DeviceModel, PlugSet, Unit};
pub use protocol::{CommandType, Version};
pub use reconcile::{Command, RequestState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
