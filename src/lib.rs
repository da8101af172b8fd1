//! tcpadb - client side of the ADB (Android Debug Bridge) wire protocol
//! over TCP.
//!
//! This library speaks the adbd framing protocol directly: it dials a
//! device, runs the CNXN/AUTH handshake (including the STLS upgrade to
//! TLS 1.3 on Android 9+), and multiplexes any number of bidirectional
//! logical streams over the connection with ADB's per-stream flow
//! control. Wireless-debugging pairing with a six-digit code is supported
//! as an out-of-band handshake against the device's pairing port.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tcpadb::{AdbConnectionManager, AdbKeyPair};
//!
//! fn main() -> Result<(), tcpadb::AdbError> {
//!     let keypair = AdbKeyPair::generate("user@host")?;
//!     let mut manager = AdbConnectionManager::new(keypair);
//!     manager.set_host_address("192.168.1.42");
//!     manager.set_timeout(Duration::from_secs(10));
//!
//!     // one-time, with the code shown in the device's developer settings
//!     manager.pair(37831, "123456")?;
//!
//!     manager.connect(5555)?;
//!     let stream = manager.open_stream("shell:getprop ro.product.model")?;
//!     let output = stream.read_to_end()?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     manager.close();
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod auth;
pub mod connection;
pub mod manager;
pub mod pairing;
pub mod protocol;
pub mod stream;
mod tls;

// Re-export main types
pub use auth::AdbKeyPair;
pub use connection::{AdbConnection, AdbConnectionBuilder};
pub use manager::AdbConnectionManager;
pub use pairing::{PairingAuthCtx, PairingConnectionCtx, PairingRole, PairingState, PeerInfo};
pub use protocol::{AdbError, AuthType, Command, Message};
pub use stream::AdbStream;
