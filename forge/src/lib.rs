//! Forge - fastboot protocol and flashing service
//!
//! The fastboot-mode half of the Nyx bootloader: it speaks the fastboot
//! wire protocol to a host tool, flashes and erases GPT partitions
//! (expanding Android sparse images), rewrites partition tables, verifies
//! Android boot images against the OEM certificate, and checks signed
//! policy payloads against a burned-in root fingerprint.
//!
//! The protocol core in [`session`] is transport- and storage-agnostic;
//! every firmware-provided capability is injected behind the traits in
//! [`device`]. The `forged` binary wires the same core to a file-backed
//! disk image and a TCP listener for bring-up and CI.

pub mod bootimg;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod hashes;
pub mod pkcs7;
pub mod platform;
pub mod protocol;
pub mod security;
pub mod session;
pub mod signature;
pub mod sparse;
pub mod vars;

#[cfg(test)]
pub(crate) mod testutil;

pub use device::{BootTarget, Device, HandoffImage, LockState};
pub use error::{FastbootError, Result};
pub use session::{Outcome, Session, SessionConfig};
