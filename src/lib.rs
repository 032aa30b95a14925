//! wifi-settings firmware library.
//!
//! Keeps WiFi hotspot details in a dedicated flash sector and manages
//! the connection for the embedding application, with an authenticated
//! remote-control service for over-the-network reconfiguration, reboot,
//! and firmware replacement.
//!
//! Two subsystems, both driven from the application's event loop:
//!
//! - [`connect::ConnectionManager`] — periodic state machine: scan,
//!   pick the highest-priority configured hotspot, join, watch link and
//!   IP health, retry.
//! - [`remote::service::RemoteService`] — TCP port 1404: challenge-
//!   response mutual authentication from `update_secret`, then an
//!   AES-256-CBC command channel dispatching to a handler table; plus a
//!   UDP discovery responder on the same port.
//!
//! All hardware access goes through the port traits in [`ports`]; the
//! adapters in [`adapters`] implement them for ESP-IDF (guarded by
//! `#[cfg(target_os = "espidf")]`) and for host-side simulation, which
//! is what the test suite runs against.

#![deny(unused_must_use)]

pub mod adapters;
pub mod connect;
pub mod flash;
pub mod ports;
pub mod remote;

mod error;

pub use error::{Error, Result};
