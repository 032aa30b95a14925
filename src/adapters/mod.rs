//! Platform adapters behind the port traits.
//!
//! Every module pairs a real implementation (guarded by
//! `#[cfg(target_os = "espidf")]`, raw `esp_idf_svc::sys` calls) with a
//! host-simulation implementation used by the test suite. The simulation
//! adapters record what was asked of them so tests can assert on the full
//! call history.

pub mod device_id;
pub mod flash;
pub mod system;
pub mod wifi;
