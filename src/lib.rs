#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # MotionMount
//!
//! A Rust library for controlling Vogels MotionMount motorized TV wall mounts
//! over Bluetooth Low Energy.
//!
//! The mount exposes two GATT services: one for movement (distance, rotation,
//! presets, auto-move, calibration) and one for the session (PIN
//! authentication, device name, firmware versions). Two firmware generations
//! speak slightly different dialects of the same attribute set; the dialect
//! is detected on every connection and every encode and decode follows it.
//!
//! ## Features
//!
//! - **State mirror**: every readable attribute is read on connect, kept up to
//!   date from notifications and refreshed periodically
//! - **Presets**: seven slots with long names split over two attributes
//! - **PIN sessions**: authorised user and supervisor roles with permission
//!   checks before anything is written
//! - **Recovery**: timeouts and lost links reconnect on a fixed interval
//! - **Events**: a broadcast stream of every state change
//!
//! ## Quick Start
//!
//! ```no_run
//! use motionmount::{MotionMount, MountConfig, MountEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mount = MotionMount::ble(MountConfig::new("AA:BB:CC:DD:EE:FF")).await?;
//!     let mut events = mount.subscribe();
//!     mount.connect().await?;
//!
//!     mount.select_preset(0).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let MountEvent::PositionChanged { distance, rotation } = event {
//!             println!("distance {distance}%, rotation {rotation}%");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without hardware
//!
//! With the `mock` feature, [`mock::MockDevice`] simulates a mount in memory,
//! including PIN handling, and its transport can be passed to
//! [`MotionMount::new`].

use uuid::Uuid;

/// Bluetooth Low Energy transport
pub mod ble;
/// Calibration progress tracking
pub mod calibration;
/// Connection lifecycle and timed attribute I/O
pub mod connection;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// State change notifications
pub mod events;
/// In-memory device for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;
/// Preset slot management
pub mod preset;
/// Attribute map and wire codecs
pub mod protocol;
/// PIN authentication and permission checks
pub mod session;
/// Type definitions and data structures
pub mod types;
/// Protocol dialect detection
pub mod variant;

pub use ble::{BleTransport, GattSession, Link, Notification, Transport};
pub use device::MotionMount;
pub use error::{AuthError, DecodeError, EncodeError, ErrorKind, MountError, Result};
pub use events::{EventBus, MountEvent};
pub use protocol::{Attribute, PinRole};
pub use types::{
    AuthLevel, AutoMove, CalibrationState, ConnectionSnapshot, ConnectionState, DeviceState,
    MountConfig, MultiPinFeatures, Permission, PinMode, Preset, SessionState, TimeoutConfig,
    Versions,
};
pub use variant::ProtocolVariant;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Movement service UUID
pub const MOVEMENT_SERVICE_UUID: Uuid = Uuid::from_u128(0x3e6f_e65d_ed78_11e4_895e_0002_6fd5_c52c);

/// Session service UUID
pub const SESSION_SERVICE_UUID: Uuid = Uuid::from_u128(0x3e6f_e65e_ed78_11e4_895e_0002_6fd5_c52c);

/// Characteristic UUID of movement attributes, with the attribute offset in
/// the fourth byte (`c005faXX-0651-4800-b000-000000000000`)
pub const MOVEMENT_CHAR_BASE: u128 = 0xc005_fa00_0651_4800_b000_0000_0000_0000;

/// Characteristic UUID of session attributes, with the attribute offset in
/// the fourth byte (`c005fcXX-0651-4800-b000-000000000000`)
pub const SESSION_CHAR_BASE: u128 = 0xc005_fc00_0651_4800_b000_0000_0000_0000;
